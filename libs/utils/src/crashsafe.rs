use std::io::Write;

use anyhow::Context;
use camino::Utf8Path;

/// Replace the contents of `path` atomically: write a sibling temp file,
/// fsync it, and rename it into place. Readers either see the old content
/// or the new, never a torn write.
pub fn overwrite(path: &Utf8Path, content: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{path} has no parent directory"))?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = std::fs::File::create(&tmp_path)
            .with_context(|| format!("create {tmp_path}"))?;
        tmp.write_all(content)
            .with_context(|| format!("write {tmp_path}"))?;
        tmp.sync_all().with_context(|| format!("fsync {tmp_path}"))?;
    }
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename {tmp_path} -> {path}"))?;
    // Persist the rename itself.
    std::fs::File::open(parent)
        .and_then(|f| f.sync_all())
        .with_context(|| format!("fsync {parent}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_replaces_content() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("addr");

        overwrite(&path, b"127.0.0.1:1").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "127.0.0.1:1");

        overwrite(&path, b"127.0.0.1:2").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "127.0.0.1:2");
    }
}
