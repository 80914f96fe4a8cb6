use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;

/// Derives the file name shown to the user and used on disk.
///
/// Takes the last non-empty path segment of the URL, percent-decoded, with
/// separators and reserved characters replaced. Falls back to
/// `download_<first 8 chars of id>` when nothing usable remains.
pub fn display_name(url: &str, id: &str) -> String {
    let candidate = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.rfind(|s| !s.is_empty()).map(str::to_owned))
        })
        .map(|seg| sanitize(&percent_decode_str(&seg).decode_utf8_lossy()));

    match candidate {
        Some(name) if is_plain_file_name(&name) => name,
        _ => fallback_name(id),
    }
}

/// Name used when the URL carries no usable file name.
pub fn fallback_name(id: &str) -> String {
    let prefix: String = id.chars().take(8).collect();
    format!("download_{prefix}")
}

/// Picks a destination in `dir` that neither exists nor is `in_use`,
/// appending ` (n)` before the extension on collision.
pub fn unique_destination<F>(dir: &Path, name: &str, in_use: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    let taken = |p: &Path| p.exists() || in_use(p);

    let first = dir.join(name);
    if !taken(&first) {
        return first;
    }

    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n: u32 = 1;
    loop {
        let candidate = dir.join(format!("{stem} ({n}){ext}"));
        if !taken(&candidate) {
            return candidate;
        }
        n = n.saturating_add(1);
    }
}

fn sanitize(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    replaced.trim().trim_end_matches('.').to_string()
}

/// True for a single normal path component (no root, prefix or `..`).
fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
