use quill::lexer::{Lexer, LexerOptions};
use quill::tokens::{Keyword, Symbol, TokenKind};

fn lex_all(input: &str, options: LexerOptions) -> Vec<TokenKind> {
    let mut lexer = Lexer::new("test.quill", input, options);
    let mut kinds = Vec::new();
    loop {
        let token = lexer.next_token().expect("lex error");
        let done = token.is_eof();
        kinds.push(token.kind);
        if done {
            break;
        }
    }
    kinds
}

fn lex(input: &str) -> Vec<TokenKind> {
    lex_all(input, LexerOptions::default())
}

fn kind_names(kinds: &[TokenKind]) -> Vec<&'static str> {
    kinds
        .iter()
        .map(|kind| match kind {
            TokenKind::Text(_) => "text",
            TokenKind::LeftDelim => "ldelim",
            TokenKind::RightDelim => "rdelim",
            TokenKind::Identifier(_) => "ident",
            TokenKind::Field(_) => "field",
            TokenKind::Number(_) => "number",
            TokenKind::Str(_) => "string",
            TokenKind::RawStr(_) => "rawstring",
            TokenKind::Bool(_) => "bool",
            TokenKind::Keyword(_) => "keyword",
            TokenKind::Symbol(_) => "symbol",
            TokenKind::Eof => "eof",
        })
        .collect()
}

fn expect_kinds(input: &str, expected: &[&str]) {
    let kinds = lex(input);
    assert_eq!(kind_names(&kinds), expected, "input {input:?}");
}

#[test]
fn empty_action() {
    expect_kinds("{{}}", &["ldelim", "rdelim", "eof"]);
}

#[test]
fn identifiers_and_fields() {
    expect_kinds("{{ line }}", &["ldelim", "ident", "rdelim", "eof"]);
    expect_kinds("{{ . }}", &["ldelim", "ident", "rdelim", "eof"]);
    expect_kinds("{{ .Field }}", &["ldelim", "field", "rdelim", "eof"]);
    let kinds = lex("{{ .A.B }}");
    assert_eq!(
        kinds[1..3],
        [
            TokenKind::Field("A".into()),
            TokenKind::Field("B".into()),
        ]
    );
}

#[test]
fn strings() {
    let kinds = lex(r#"{{ "value" }}"#);
    assert_eq!(kinds[1], TokenKind::Str("value".to_string()));
    let kinds = lex("{{ `raw \"x\"` }}");
    assert_eq!(kinds[1], TokenKind::RawStr("raw \"x\"".to_string()));
    let kinds = lex(r#"{{ "a\nb" }}"#);
    assert_eq!(kinds[1], TokenKind::Str("a\nb".to_string()));
}

#[test]
fn call_with_colon() {
    expect_kinds(
        "{{ call: value }}",
        &["ldelim", "ident", "symbol", "ident", "rdelim", "eof"],
    );
}

#[test]
fn operators_after_field() {
    for (src, symbol) in [
        ("{{.Ex+1}}", Symbol::Plus),
        ("{{.Ex-1}}", Symbol::Minus),
        ("{{.Ex*1}}", Symbol::Star),
        ("{{.Ex/1}}", Symbol::Slash),
        ("{{.Ex%1}}", Symbol::Percent),
        ("{{.Ex=1}}", Symbol::Assign),
        ("{{.Ex!1}}", Symbol::Not),
        ("{{.Ex==1}}", Symbol::EqEq),
        ("{{.Ex&&1}}", Symbol::AndAnd),
    ] {
        let kinds = lex(src);
        assert_eq!(kinds[2], TokenKind::Symbol(symbol), "input {src:?}");
        assert!(matches!(kinds[3], TokenKind::Number(_)), "input {src:?}");
    }
}

#[test]
fn declare_symbol() {
    let kinds = lex("{{Ex:=1}}");
    assert_eq!(kinds[2], TokenKind::Symbol(Symbol::Declare));
}

#[test]
fn negative_numbers() {
    let kinds = lex("{{ -1 }}");
    assert_eq!(kinds[1], TokenKind::Number("-1".into()));

    // after an operator a sign starts a literal; after an operand it is an
    // operator
    let kinds = lex("{{ 5 + -1 }}");
    assert_eq!(kinds[2], TokenKind::Symbol(Symbol::Plus));
    assert_eq!(kinds[3], TokenKind::Number("-1".into()));

    let kinds = lex("{{ 5 * -1 }}");
    assert_eq!(kinds[3], TokenKind::Number("-1".into()));

    let kinds = lex("{{ x - 1 }}");
    assert_eq!(kinds[2], TokenKind::Symbol(Symbol::Minus));
}

#[test]
fn keywords_in_actions() {
    let kinds = lex("{{if x>y}}blahblah...{{end}}");
    assert_eq!(
        kind_names(&kinds),
        [
            "ldelim", "keyword", "ident", "symbol", "ident", "rdelim", "text", "ldelim",
            "keyword", "rdelim", "eof"
        ]
    );
    assert_eq!(kinds[1], TokenKind::Keyword(Keyword::If));
    assert_eq!(kinds[8], TokenKind::Keyword(Keyword::End));
}

#[test]
fn comments_produce_no_tokens() {
    let kinds = lex("hello {*Buddy*} World");
    assert_eq!(
        kinds,
        [
            TokenKind::Text("hello ".to_string()),
            TokenKind::Text(" World".to_string()),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn unterminated_comment_is_an_error() {
    let mut lexer = Lexer::new("test.quill", "a {* b", LexerOptions::default());
    lexer.next_token().expect("text before the comment");
    let err = lexer.next_token().expect_err("comment never closes");
    assert!(err.to_string().contains("unterminated comment"), "{err}");
}

#[test]
fn unterminated_action_is_an_error() {
    let mut lexer = Lexer::new("test.quill", "{{ x ", LexerOptions::default());
    lexer.next_token().expect("left delim");
    lexer.next_token().expect("identifier");
    let err = lexer.next_token().expect_err("action never closes");
    assert!(err.to_string().contains("unterminated action"), "{err}");
}

#[test]
fn unterminated_string_is_an_error() {
    let mut lexer = Lexer::new("test.quill", r#"{{ "abc }}"#, LexerOptions::default());
    lexer.next_token().expect("left delim");
    let err = lexer.next_token().expect_err("string never closes");
    assert!(err.to_string().contains("unterminated string"), "{err}");
}

#[test]
fn trim_markers() {
    let kinds = lex("x {{- 1 -}} y");
    assert_eq!(
        kinds,
        [
            TokenKind::Text("x".to_string()),
            TokenKind::LeftDelim,
            TokenKind::Number("1".into()),
            TokenKind::RightDelim,
            TokenKind::Text("y".to_string()),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn trim_marker_requires_whitespace() {
    // hugging a digit, the dash is a sign, not a trim marker
    let kinds = lex("x {{-3}}");
    assert_eq!(kinds[0], TokenKind::Text("x ".to_string()));
    assert_eq!(kinds[2], TokenKind::Number("-3".into()));
}

#[test]
fn custom_delimiters_produce_the_same_stream() {
    let default_kinds = lex("a {{ x + 1 }} b");
    let custom = LexerOptions {
        left_delim: "<<".to_string(),
        right_delim: ">>".to_string(),
        trim_markers: true,
    };
    let custom_kinds = lex_all("a << x + 1 >> b", custom);
    assert_eq!(kind_names(&default_kinds), kind_names(&custom_kinds));
}

#[test]
fn default_delimiters_are_text_under_custom_pair() {
    let custom = LexerOptions {
        left_delim: "<<".to_string(),
        right_delim: ">>".to_string(),
        trim_markers: true,
    };
    let kinds = lex_all("{{ not an action }}", custom);
    assert_eq!(
        kinds,
        [
            TokenKind::Text("{{ not an action }}".to_string()),
            TokenKind::Eof,
        ]
    );
}

#[test]
fn char_and_hex_literals() {
    let kinds = lex("{{ 'a' + 0x10 }}");
    assert_eq!(kinds[1], TokenKind::Number("'a'".into()));
    assert_eq!(kinds[3], TokenKind::Number("0x10".into()));
}

#[test]
fn line_numbers_are_stamped() {
    let mut lexer = Lexer::new("test.quill", "a\nb\n{{ x }}", LexerOptions::default());
    let text = lexer.next_token().expect("text");
    assert_eq!(text.line, 1);
    let delim = lexer.next_token().expect("left delim");
    assert_eq!(delim.line, 3);
}
