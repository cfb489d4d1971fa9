//! `.env` support: `--env-file <path>` on the command line, else `./.env`
//! when present. Variables already set in the process environment win.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct LoadedEnvFile {
    pub path: PathBuf,
    /// Named on the command line rather than picked up from the cwd.
    pub explicit: bool,
}

/// Path given with `--env-file`, if any.
pub fn env_file_arg<I: IntoIterator<Item = OsString>>(args: I) -> Result<Option<PathBuf>, String> {
    let mut args = args.into_iter();
    let mut found: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        let Some(arg) = arg.to_str() else {
            return Err("argument contains invalid UTF-8".to_string());
        };
        let value = if arg == "--env-file" {
            PathBuf::from(
                args.next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?,
            )
        } else if let Some(v) = arg.strip_prefix("--env-file=") {
            PathBuf::from(v)
        } else if arg == "--" {
            break;
        } else {
            return Err(format!("unrecognised argument: {}", arg));
        };

        if value.as_os_str().is_empty() {
            return Err("`--env-file` requires a path argument".to_string());
        }
        if found.replace(value).is_some() {
            return Err("`--env-file` provided more than once".to_string());
        }
    }
    Ok(found)
}

/// Loads the env file named on the command line, or `./.env`.
pub fn load_from_cli() -> Result<Option<LoadedEnvFile>, String> {
    // skip program name
    if let Some(path) = env_file_arg(std::env::args_os().skip(1))? {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        apply(&path)?;
        return Ok(Some(LoadedEnvFile { path, explicit: true }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let path = cwd.join(".env");
    if !path.is_file() {
        return Ok(None);
    }
    apply(&path)?;
    Ok(Some(LoadedEnvFile { path, explicit: false }))
}

fn apply(path: &Path) -> Result<(), String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (key, value) in parse(&raw).map_err(|e| format!("{}:{}", path.display(), e))? {
        if std::env::var_os(&key).is_none() {
            // SAFETY: called from main before any other thread exists.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// All assignments in an env file. Errors carry the 1-based line number.
pub fn parse(raw: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if let Some(pair) = parse_line(line).map_err(|e| format!("{}: {}", idx + 1, e))? {
            out.push(pair);
        }
    }
    Ok(out)
}

fn parse_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let (key, value) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() {
        return Err("environment variable name cannot be empty".to_string());
    }
    if key.contains(char::is_whitespace) {
        return Err(format!("environment variable name contains whitespace: {}", key));
    }

    let value = value.trim();
    let value = match value.chars().next() {
        Some(q @ ('"' | '\'')) => quoted(&value[1..], q)?,
        _ => value.split('#').next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}

/// Body of a quoted value. Escapes are only honoured inside double quotes.
fn quoted(input: &str, quote: char) -> Result<String, String> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((i, ch)) = chars.next() {
        if ch == quote {
            let rest = input[i + ch.len_utf8()..].trim();
            if rest.is_empty() || rest.starts_with('#') {
                return Ok(value);
            }
            return Err(format!("unexpected characters after closing {} quote", quote));
        }
        if ch == '\\' && quote == '"' {
            let Some((_, escaped)) = chars.next() else { break };
            value.push(match escaped {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            continue;
        }
        value.push(ch);
    }
    Err(format!("unterminated {}-quoted value", quote))
}
