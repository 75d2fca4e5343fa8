//! Packs a set of files into one directory-aware XML document.

use std::collections::HashSet;
use std::path::Path;

/// Render `paths` (relative to `root`) as a `<directory_structure>` tree
/// followed by every file's content with 1-based line numbers.
///
/// Any unreadable or non-UTF-8 file fails the whole pack.
pub async fn pack_files(root: &Path, paths: &[String]) -> std::io::Result<String> {
    let mut sorted: Vec<&String> = paths.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut out = String::new();
    out.push_str("<directory_structure>\n");
    out.push_str(&directory_tree(&sorted));
    out.push_str("</directory_structure>\n\n<files>\n");

    for path in sorted {
        let content = tokio::fs::read_to_string(root.join(path.as_str())).await?;
        out.push_str(&format!("<file path=\"{}\">\n", escape_attr(path)));
        for (idx, line) in content.lines().enumerate() {
            out.push_str(&format!("{}: {}\n", idx + 1, line));
        }
        out.push_str("</file>\n\n");
    }
    out.push_str("</files>\n");
    Ok(out)
}

fn directory_tree(sorted: &[&String]) -> String {
    let mut printed: HashSet<String> = HashSet::new();
    let mut tree = String::new();
    for path in sorted {
        let segments: Vec<&str> = path.split('/').collect();
        let (name, dirs) = match segments.split_last() {
            Some(split) => split,
            None => continue,
        };
        for depth in 0..dirs.len() {
            let prefix = dirs[..=depth].join("/");
            if printed.insert(prefix) {
                tree.push_str(&format!("{}{}/\n", "  ".repeat(depth), dirs[depth]));
            }
        }
        tree.push_str(&format!("{}{}\n", "  ".repeat(dirs.len()), name));
    }
    tree
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}
