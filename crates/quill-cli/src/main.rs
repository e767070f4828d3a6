use anyhow::{bail, Context, Result};
use clap::Parser;
use quill::{OsLoader, Set, Value, VarMap};

#[derive(Parser, Debug)]
#[command(name = "quill", version, about = "Render a quill template to stdout")]
struct Args {
    /// Template name, resolved against the root directory
    #[arg(value_name = "TEMPLATE")]
    template: String,

    /// Directory templates are loaded from
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    root: String,

    /// JSON object file providing the variable map
    #[arg(long, value_name = "FILE")]
    vars: Option<String>,

    /// JSON file providing the context value (the implicit `.`)
    #[arg(long, value_name = "FILE")]
    context: Option<String>,

    /// Left action delimiter
    #[arg(long, default_value = "{{")]
    left: String,

    /// Right action delimiter
    #[arg(long, default_value = "}}")]
    right: String,

    /// Write values verbatim instead of HTML-escaping them
    #[arg(long)]
    no_escape: bool,

    /// Development mode: re-parse templates on every request
    #[arg(long)]
    dev: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let loader = OsLoader::new(&args.root);
    let mut set = if args.no_escape {
        Set::new(loader)
    } else {
        Set::new_html(loader)
    };
    set.set_development_mode(args.dev);
    set.set_delims(&args.left, &args.right);

    let mut vars = VarMap::new();
    if let Some(path) = &args.vars {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading variables from {path}"))?;
        let parsed: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
        let serde_json::Value::Object(entries) = parsed else {
            bail!("{path}: variables must be a JSON object");
        };
        for (name, value) in entries {
            vars.set(name.as_str(), Value::from(value));
        }
    }

    let context = match &args.context {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading context from {path}"))?;
            let parsed: serde_json::Value =
                serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?;
            Value::from(parsed)
        }
        None => Value::Invalid,
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    set.render(&args.template, &mut out, &vars, context)?;
    Ok(())
}
