//! Text rendering for everything launchpad writes onto a host.
//!
//! | Module | Produces |
//! |--------|----------|
//! | `nginx` | server blocks and the main `nginx.conf` |
//! | `process` | PM2 ecosystem JSON and systemd units |
//! | (this module) | placeholder `index.html` and `.env` files |

pub mod nginx;
pub mod process;

use std::collections::BTreeMap;

pub use nginx::{NginxSite, SiteKind, TlsCert, render_main_config};
pub use process::{Pm2Ecosystem, Pm2Params, ProcessManager, SystemdUnit};

/// Welcome page written into a freshly deployed static site.
pub fn render_placeholder_page(domain: &str, site_type: &str, deployed_at: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{domain}</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif; margin: 0; min-height: 100vh; display: flex; align-items: center; justify-content: center; background: #0f172a; color: #e2e8f0; }}
        main {{ text-align: center; padding: 2rem; }}
        h1 {{ font-size: 2.5rem; margin-bottom: 0.5rem; }}
        dl {{ display: inline-grid; grid-template-columns: auto auto; gap: 0.25rem 1rem; text-align: left; }}
        dt {{ color: #94a3b8; }}
    </style>
</head>
<body>
    <main>
        <h1>{domain}</h1>
        <p>This site is live. Replace this page with your own content.</p>
        <dl>
            <dt>Site type</dt><dd>{site_type}</dd>
            <dt>Deployed</dt><dd>{deployed_at}</dd>
        </dl>
    </main>
</body>
</html>
"#
    )
}

/// Render `KEY=VALUE` lines for a `.env` file.
///
/// Values with shell-significant characters are single-quoted (literal in
/// dotenv syntax); values that themselves contain `'` fall back to double
/// quotes with escapes.
pub fn render_env_file(vars: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in vars {
        let needs_quotes = value.is_empty()
            || value
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '#' | '=' | '$' | '\\'));
        if needs_quotes && !value.contains('\'') {
            out.push_str(&format!("{}='{}'\n", key, value));
        } else if needs_quotes {
            let escaped = value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('$', "\\$");
            out.push_str(&format!("{}=\"{}\"\n", key, escaped));
        } else {
            out.push_str(&format!("{}={}\n", key, value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_page_mentions_domain() {
        let html = render_placeholder_page("example.com", "static", "2025-01-01 12:00:00");
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<title>example.com</title>"));
        assert!(html.contains("<dd>static</dd>"));
    }

    #[test]
    fn test_env_file_quoting() {
        let mut vars = BTreeMap::new();
        vars.insert("PORT".to_string(), "3000".to_string());
        vars.insert("GREETING".to_string(), "hello world".to_string());
        vars.insert("EMPTY".to_string(), String::new());
        let text = render_env_file(&vars);
        assert_eq!(text, "EMPTY=''\nGREETING='hello world'\nPORT=3000\n");
    }

    #[test]
    fn test_env_file_round_trips_through_dotenvy() {
        let mut vars = BTreeMap::new();
        vars.insert("DATABASE_URL".to_string(), "postgres://u:p@h/db?x=1".to_string());
        vars.insert("QUOTE".to_string(), "say \"hi\"".to_string());
        let text = render_env_file(&vars);
        let parsed: BTreeMap<String, String> = dotenvy::from_read_iter(text.as_bytes())
            .map(|item| item.unwrap())
            .collect();
        assert_eq!(parsed, vars);
    }
}
