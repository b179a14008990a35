//! Custom property extraction for loaded stylesheets.

use std::collections::BTreeMap;

/// Collect the custom properties (`--name: value`) declared in `:root` rules,
/// including rules nested inside at-rule blocks such as `@media`.
pub fn extract_variables(css: &str) -> BTreeMap<String, String> {
    let css = strip_comments(css);
    let mut variables = BTreeMap::new();
    let mut blocks: Vec<(String, usize)> = Vec::new();
    let mut prelude_start = 0;

    for (index, c) in css.char_indices() {
        match c {
            '{' => {
                let selector = css[prelude_start..index].trim().to_string();
                blocks.push((selector, index + 1));
                prelude_start = index + 1;
            }
            '}' => {
                if let Some((selector, body_start)) = blocks.pop() {
                    if selector == ":root" {
                        parse_declarations(&css[body_start..index], &mut variables);
                    }
                }
                prelude_start = index + 1;
            }
            ';' => prelude_start = index + 1,
            _ => {}
        }
    }

    variables
}

fn parse_declarations(body: &str, variables: &mut BTreeMap<String, String>) {
    for declaration in body.split(';') {
        if let Some((name, value)) = declaration.split_once(':') {
            let name = name.trim();
            if name.starts_with("--") {
                variables.insert(name.to_string(), value.trim().to_string());
            }
        }
    }
}

fn strip_comments(css: &str) -> String {
    let mut result = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(start) = rest.find("/*") {
        result.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    result.push_str(rest);
    result
}
