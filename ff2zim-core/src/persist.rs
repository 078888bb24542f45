use std::io::Write;
use std::path::Path;

/// Replace `path` with `contents` in one step: write a temp file in the
/// same directory, flush it, then rename it over the destination.
/// Readers never observe a half-written file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Lines of a plain-text list file, skipping blank lines and `#` comments.
pub fn list_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "old").unwrap();

        write_atomic(&path, b"new").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1, "temp file must be renamed, not left behind");
    }

    #[test]
    fn list_lines_skips_blank_and_comment_lines() {
        let text = "\n# header\nhttps://a\n   \n  https://b  \n#https://c\n";
        let lines: Vec<_> = list_lines(text).collect();
        assert_eq!(lines, vec!["https://a", "https://b"]);
    }
}
