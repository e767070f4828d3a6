use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::io;

// Shorter entities win: &#34; over &quot;, &#39; over &apos;.
const HTML_QUOT: &[u8] = b"&#34;";
const HTML_APOS: &[u8] = b"&#39;";
const HTML_AMP: &[u8] = b"&amp;";
const HTML_LT: &[u8] = b"&lt;";
const HTML_GT: &[u8] = b"&gt;";

/// Write `b` to `out`, escaping the five HTML-significant bytes.
pub fn html_escape(out: &mut dyn io::Write, b: &[u8]) -> io::Result<()> {
    let mut last = 0;
    for (i, c) in b.iter().enumerate() {
        let entity: &[u8] = match c {
            b'"' => HTML_QUOT,
            b'\'' => HTML_APOS,
            b'&' => HTML_AMP,
            b'<' => HTML_LT,
            b'>' => HTML_GT,
            _ => continue,
        };
        out.write_all(&b[last..i])?;
        out.write_all(entity)?;
        last = i + 1;
    }
    out.write_all(&b[last..])
}

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn js_is_special(c: u8) -> bool {
    matches!(c, b'\\' | b'\'' | b'"' | b'<' | b'>') || c < b' ' || c >= 0x80
}

/// Whether a decoded rune may appear verbatim inside a JS string literal.
/// U+2028/U+2029 terminate the literal when embedded raw, so they and the
/// other non-printable runes get hex-escaped instead.
fn js_is_printable(r: char) -> bool {
    !(r.is_control() || r == '\u{2028}' || r == '\u{2029}' || (r.is_whitespace() && !r.is_ascii()))
}

/// Decode one UTF-8 rune at the start of `b`; an invalid sequence yields
/// `None` with a width of one byte.
fn decode_rune(b: &[u8]) -> (Option<char>, usize) {
    let len = match b[0] {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => return (None, 1),
    };
    if b.len() < len {
        return (None, 1);
    }
    match std::str::from_utf8(&b[..len]) {
        Ok(s) => (s.chars().next(), len),
        Err(_) => (None, 1),
    }
}

/// Write `b` to `out`, escaping quotes, slashes, angle brackets, control
/// characters and non-printable runes the way a JS string literal needs
/// them.
pub fn js_escape(out: &mut dyn io::Write, b: &[u8]) -> io::Result<()> {
    let mut last = 0;
    let mut i = 0;
    while i < b.len() {
        let c = b[i];
        if !js_is_special(c) {
            i += 1;
            continue;
        }
        out.write_all(&b[last..i])?;
        if c < 0x80 {
            match c {
                b'\\' => out.write_all(br"\\")?,
                b'\'' => out.write_all(br"\'")?,
                b'"' => out.write_all(br#"\""#)?,
                b'<' => out.write_all(br"\x3C")?,
                b'>' => out.write_all(br"\x3E")?,
                _ => {
                    out.write_all(br"\u00")?;
                    out.write_all(&[HEX[(c >> 4) as usize], HEX[(c & 0x0f) as usize]])?;
                }
            }
            i += 1;
        } else {
            let (rune, size) = decode_rune(&b[i..]);
            match rune {
                Some(r) if js_is_printable(r) => out.write_all(&b[i..i + size])?,
                Some(r) => write!(out, "\\u{:04X}", r as u32)?,
                None => out.write_all(&b[i..i + size])?,
            }
            i += size;
        }
        last = i;
    }
    out.write_all(&b[last..])
}

/// Pass-through writer used by `unsafe`.
pub fn raw_writer(out: &mut dyn io::Write, b: &[u8]) -> io::Result<()> {
    out.write_all(b)
}

/// HTML-escape into an owned string (the `html` helper).
pub fn html_escape_string(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    html_escape(&mut out, s.as_bytes()).expect("writing to a Vec cannot fail");
    String::from_utf8(out).expect("escaping preserves utf-8")
}

const QUERY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode a query component (the `url` helper). Spaces become `+`
/// as form encoding expects.
pub fn url_query_escape(s: &str) -> String {
    let encoded = utf8_percent_encode(s, QUERY).to_string();
    encoded.replace("%20", "+")
}
