//! HTML to React component conversion.
//!
//! A regex-driven converter, not an HTML parser: it rewrites attribute names
//! to their JSX spelling, turns comments into `{/* */}`, self-closes void
//! elements and drops `<style>`/`<script>` blocks. The interesting part of a
//! page (the `<body>`, or failing that a main container) is wrapped in a
//! default-exported function component.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::{Captures, Regex};

static ATTRIBUTE_RENAMES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\bclass=", "className="),
        (r"\bfor=", "htmlFor="),
        (r"\bfill-rule=", "fillRule="),
        (r"\bclip-rule=", "clipRule="),
        (r"\bstroke-linecap=", "strokeLinecap="),
        (r"\bstroke-linejoin=", "strokeLinejoin="),
        (r"\bstroke-width=", "strokeWidth="),
        (r"\bstroke-dasharray=", "strokeDasharray="),
        (r"\bstroke-dashoffset=", "strokeDashoffset="),
        (r"\btabindex=", "tabIndex="),
        (r"\breadonly\b", "readOnly"),
        (r"\bmaxlength=", "maxLength="),
        (r"\bautofocus\b", "autoFocus"),
        (r"\bautoplay\b", "autoPlay"),
        (r"\bautocomplete=", "autoComplete="),
        (r"\bcolspan=", "colSpan="),
        (r"\browspan=", "rowSpan="),
        (r"\bcontenteditable=", "contentEditable="),
        (r"xlink:href=", "href="),
        (r#"\s*xmlns:xlink="[^"]*""#, ""),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), replacement))
    .collect()
});

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<!--([\s\S]*?)-->").unwrap());

static VOID_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(input|img|br|hr|area|base|col|embed|source|track|wbr|meta|link)\b([^>]*)>")
        .unwrap()
});

static STYLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<style[\s\S]*?>[\s\S]*?</style>").unwrap());

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<script[\s\S]*?>[\s\S]*?</script>").unwrap());

static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

static RUNS_OF_SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"  +").unwrap());

static BODY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<body[^>]*>(.*?)</body>").unwrap());

static CONTAINERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?is)<div[^>]*class="[^"]*container[^"]*"[^>]*>(.*?)</div>"#,
        r#"(?is)<div[^>]*class="[^"]*wrapper[^"]*"[^>]*>(.*?)</div>"#,
        r#"(?is)<div[^>]*class="[^"]*main[^"]*"[^>]*>(.*?)</div>"#,
        r"(?is)<main[^>]*>(.*?)</main>",
        r"(?is)<article[^>]*>(.*?)</article>",
        r"(?is)<section[^>]*>(.*?)</section>",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

static HTML_ROOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<html[^>]*>(.*?)</html>").unwrap());

static HEAD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<head[^>]*>.*?</head>").unwrap());

static COMPONENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][a-zA-Z0-9]*$").unwrap());

/// Rewrite an HTML fragment into JSX syntax.
pub fn html_to_jsx(html: &str) -> String {
    let mut jsx = html.to_string();
    for (pattern, replacement) in ATTRIBUTE_RENAMES.iter() {
        jsx = pattern.replace_all(&jsx, *replacement).into_owned();
    }

    jsx = COMMENT.replace_all(&jsx, "{/*${1}*/}").into_owned();

    jsx = VOID_ELEMENT
        .replace_all(&jsx, |caps: &Captures| {
            let attrs = caps[2].trim_end();
            if attrs.ends_with('/') {
                caps[0].to_string()
            } else {
                format!("<{}{} />", &caps[1], attrs)
            }
        })
        .into_owned();

    jsx = STYLE_BLOCK.replace_all(&jsx, "").into_owned();
    jsx = SCRIPT_BLOCK.replace_all(&jsx, "").into_owned();

    jsx = BLANK_LINES.replace_all(&jsx, "\n\n").into_owned();
    RUNS_OF_SPACES.replace_all(&jsx, " ").into_owned()
}

/// Pick the part of a page worth turning into a component.
///
/// Tries `<body>`, then common container elements, then `<html>` minus its
/// `<head>`, and finally the whole input.
pub fn extract_component_content(html: &str) -> String {
    if let Some(caps) = BODY.captures(html) {
        return caps[1].trim().to_string();
    }
    for pattern in CONTAINERS.iter() {
        if let Some(caps) = pattern.captures(html) {
            return caps[1].trim().to_string();
        }
    }
    if let Some(caps) = HTML_ROOT.captures(html) {
        return HEAD.replace_all(&caps[1], "").trim().to_string();
    }
    html.trim().to_string()
}

pub fn is_valid_component_name(name: &str) -> bool {
    COMPONENT_NAME.is_match(name)
}

/// PascalCase component name from a file stem, `MyComponent` as fallback.
pub fn component_name_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name: String = stem
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect();

    if is_valid_component_name(&name) {
        name
    } else {
        "MyComponent".to_string()
    }
}

/// Wrap JSX in a default-exported function component.
///
/// Multi-line content is wrapped in a fragment.
pub fn create_component(jsx: &str, name: &str, add_imports: bool) -> String {
    let lines: Vec<String> = jsx
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| format!("    {}", line))
        .collect();

    let mut parts: Vec<String> = Vec::new();
    if add_imports {
        parts.push("import React from 'react'".to_string());
        parts.push(String::new());
    }
    parts.push(format!("export default function {}() {{", name));
    parts.push("  return (".to_string());
    if lines.len() == 1 {
        parts.push(lines[0].clone());
    } else {
        parts.push("    <>".to_string());
        parts.extend(lines.iter().map(|line| format!("  {}", line)));
        parts.push("    </>".to_string());
    }
    parts.push("  )".to_string());
    parts.push("}".to_string());
    parts.join("\n")
}

/// `page.html` becomes `page.jsx`; a `.jsx` input becomes `page_component.jsx`.
pub fn default_output_path(input: &Path) -> PathBuf {
    let is_jsx = input
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("jsx"))
        .unwrap_or(false);
    if is_jsx {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        input.with_file_name(format!("{}_component.jsx", stem))
    } else {
        input.with_extension("jsx")
    }
}

/// Outcome of converting one file.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub output: PathBuf,
    pub component_name: String,
}

/// Convert an HTML file into a React component file.
pub fn convert_file(
    input: &Path,
    output: Option<&Path>,
    component_name: Option<&str>,
    add_imports: bool,
) -> Result<Conversion> {
    if let Some(name) = component_name {
        if !is_valid_component_name(name) {
            bail!(
                "Invalid component name '{}': must start with an uppercase letter and contain only letters and digits",
                name
            );
        }
    }

    let html = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let content = extract_component_content(&html);
    let jsx = html_to_jsx(&content);
    let name = component_name
        .map(str::to_string)
        .unwrap_or_else(|| component_name_from_path(input));
    let component = create_component(&jsx, &name, add_imports);

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output_path(input));
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(&output, format!("{}\n", component))
        .with_context(|| format!("Failed to write {}", output.display()))?;
    tracing::debug!(input = %input.display(), output = %output.display(), "converted HTML to JSX");

    Ok(Conversion {
        output,
        component_name: name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_class_becomes_class_name() {
        assert_eq!(html_to_jsx(r#"<div class="x">hi</div>"#), r#"<div className="x">hi</div>"#);
    }

    #[test]
    fn test_void_element_self_closes() {
        assert_eq!(html_to_jsx(r#"<img src="a">"#), r#"<img src="a" />"#);
        assert_eq!(html_to_jsx("<br>"), "<br />");
        assert_eq!(html_to_jsx(r#"<input type="text"/>"#), r#"<input type="text"/>"#);
    }

    #[test]
    fn test_void_match_respects_word_boundary() {
        let jsx = html_to_jsx("<colgroup><col span=\"2\"></colgroup>");
        assert_eq!(jsx, "<colgroup><col span=\"2\" /></colgroup>");
    }

    #[test]
    fn test_label_and_svg_attributes() {
        let jsx = html_to_jsx(
            r#"<label for="email">Email</label><path fill-rule="evenodd" stroke-width="2"/>"#,
        );
        assert!(jsx.contains(r#"htmlFor="email""#));
        assert!(jsx.contains(r#"fillRule="evenodd""#));
        assert!(jsx.contains(r#"strokeWidth="2""#));
    }

    #[test]
    fn test_boolean_and_numeric_attributes() {
        let jsx = html_to_jsx(r#"<input readonly autofocus maxlength="5" tabindex="1">"#);
        assert_eq!(jsx, r#"<input readOnly autoFocus maxLength="5" tabIndex="1" />"#);
    }

    #[test]
    fn test_xlink_handling() {
        let jsx = html_to_jsx(
            r##"<svg xmlns:xlink="http://www.w3.org/1999/xlink"><use xlink:href="#icon"></use></svg>"##,
        );
        assert_eq!(jsx, r##"<svg><use href="#icon"></use></svg>"##);
    }

    #[test]
    fn test_comments_and_blocks() {
        let jsx = html_to_jsx(
            "<!-- nav --><nav></nav><style>.a{color:red}</style><script>alert(1)</script>",
        );
        assert_eq!(jsx, "{/* nav */}<nav></nav>");
    }

    #[test]
    fn test_whitespace_collapse() {
        assert_eq!(html_to_jsx("<p>a    b</p>\n\n\n\n<p>c</p>"), "<p>a b</p>\n\n<p>c</p>");
    }

    #[test]
    fn test_extract_prefers_body() {
        let html = "<html><head><title>t</title></head><body class=\"x\">\n<h1>Hi</h1>\n</body></html>";
        assert_eq!(extract_component_content(html), "<h1>Hi</h1>");
    }

    #[test]
    fn test_extract_container_and_html_fallbacks() {
        let html = r#"<div class="page-container"><p>inside</p></div>"#;
        assert_eq!(extract_component_content(html), "<p>inside</p>");

        let html = "<html><head><title>t</title></head><p>loose</p></html>";
        assert_eq!(extract_component_content(html), "<p>loose</p>");

        assert_eq!(extract_component_content("  <p>raw</p> "), "<p>raw</p>");
    }

    #[test]
    fn test_component_name_from_path() {
        assert_eq!(component_name_from_path(Path::new("landing-page.html")), "LandingPage");
        assert_eq!(component_name_from_path(Path::new("/x/about_us.html")), "AboutUs");
        assert_eq!(component_name_from_path(Path::new("123.html")), "MyComponent");
        assert_eq!(component_name_from_path(Path::new("---.html")), "MyComponent");
    }

    #[test]
    fn test_create_component_single_line() {
        let out = create_component("<h1>Hi</h1>", "Hello", true);
        assert_eq!(
            out,
            "import React from 'react'\n\nexport default function Hello() {\n  return (\n    <h1>Hi</h1>\n  )\n}"
        );
    }

    #[test]
    fn test_create_component_wraps_fragment() {
        let out = create_component("<h1>A</h1>\n\n<p>B</p>", "Page", false);
        assert_eq!(
            out,
            "export default function Page() {\n  return (\n    <>\n      <h1>A</h1>\n      <p>B</p>\n    </>\n  )\n}"
        );
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(default_output_path(Path::new("a/page.html")), PathBuf::from("a/page.jsx"));
        assert_eq!(
            default_output_path(Path::new("a/page.jsx")),
            PathBuf::from("a/page_component.jsx")
        );
    }

    #[test]
    fn test_convert_file_end_to_end() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("pricing-table.html");
        std::fs::write(
            &input,
            "<html><body><div class=\"card\"><img src=\"a.png\"></div></body></html>",
        )
        .unwrap();

        let result = convert_file(&input, None, None, true).unwrap();
        assert_eq!(result.component_name, "PricingTable");
        assert_eq!(result.output, dir.path().join("pricing-table.jsx"));

        let text = std::fs::read_to_string(&result.output).unwrap();
        assert!(text.contains("export default function PricingTable() {"));
        assert!(text.contains(r#"<div className="card"><img src="a.png" /></div>"#));
    }

    #[test]
    fn test_convert_file_rejects_bad_component_name() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("a.html");
        std::fs::write(&input, "<p>x</p>").unwrap();
        let err = convert_file(&input, None, Some("lowercase"), true).unwrap_err();
        assert!(err.to_string().contains("Invalid component name"));
    }
}
