use crate::fs::write_atomic;
use crate::service::ServiceEntry;
use std::fmt::Write;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Tag carried by every line vipd owns in the resolution file.
pub const MANAGED_MARKER: &str = "# __vipd_managed";

/// The managed lines of a hosts-style resolution file.
///
/// Lines carrying [`MANAGED_MARKER`] belong to vipd and are regenerated on every
/// rewrite. Everything else is left byte-for-byte as found, in order.
#[derive(Debug, Clone)]
pub struct ResolutionFile {
    path: PathBuf,
}

impl ResolutionFile {
    pub const fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file. A missing file reads as empty.
    pub async fn read(&self) -> io::Result<String> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Computes the new file contents.
    ///
    /// Managed lines are dropped from `current_content`; when `include` is set,
    /// one line per entry is appended, ordered by service name.
    pub fn update_content(
        &self,
        current_content: &str,
        entries: &[ServiceEntry],
        include: bool,
    ) -> String {
        let mut output = String::with_capacity(current_content.len());
        for line in current_content.split_inclusive('\n') {
            if !line.contains(MANAGED_MARKER) {
                output.push_str(line);
            }
        }

        if !include || entries.is_empty() {
            return output;
        }

        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }

        let mut sorted: Vec<&ServiceEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in sorted {
            let _ = writeln!(
                output,
                "{} {} {MANAGED_MARKER}",
                entry.virtual_address,
                entry.hostname()
            );
        }
        output
    }

    /// Rewrites the file in place through a temporary sibling and a rename.
    pub async fn rewrite(&self, entries: &[ServiceEntry], include: bool) -> io::Result<()> {
        let current = self.read().await?;
        let updated = self.update_content(&current, entries, include);
        write_atomic(&self.path, updated.as_bytes()).await?;
        tracing::debug!(
            "Rewrote {} with {} managed entries",
            self.path.display(),
            if include { entries.len() } else { 0 }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn entry(name: &str, last_octet: u8) -> ServiceEntry {
        ServiceEntry {
            name: name.to_string(),
            backend_address: Ipv4Addr::LOCALHOST,
            backend_port: 8080,
            virtual_address: Ipv4Addr::new(172, 22, 0, last_octet),
            virtual_port: 80,
        }
    }

    #[test]
    fn test_append_managed_lines() {
        let hosts = ResolutionFile::with_path(PathBuf::from("/tmp/hosts"));
        let content = "127.0.0.1 localhost\n";
        let entries = vec![entry("web", 1), entry("api", 2)];

        let new_content = hosts.update_content(content, &entries, true);

        assert_eq!(
            new_content,
            "127.0.0.1 localhost\n\
             172.22.0.2 api.svc # __vipd_managed\n\
             172.22.0.1 web.svc # __vipd_managed\n"
        );
    }

    #[test]
    fn test_replace_existing_lines() {
        let hosts = ResolutionFile::with_path(PathBuf::from("/tmp/hosts"));
        let content = "127.0.0.1 localhost\n\
                       172.22.0.9 old.svc # __vipd_managed\n\
                       ::1 localhost\n";

        let new_content = hosts.update_content(content, &[entry("new", 3)], true);

        assert!(new_content.contains("172.22.0.3 new.svc # __vipd_managed"));
        assert!(!new_content.contains("old.svc"));
        assert!(new_content.starts_with("127.0.0.1 localhost\n::1 localhost\n"));
        assert_eq!(new_content.matches(MANAGED_MARKER).count(), 1);
    }

    #[test]
    fn test_strip_managed_lines() {
        let hosts = ResolutionFile::with_path(PathBuf::from("/tmp/hosts"));
        let content = "127.0.0.1 localhost\n\
                       172.22.0.1 web.svc # __vipd_managed\n";

        let new_content = hosts.update_content(content, &[entry("web", 1)], false);

        assert_eq!(new_content, "127.0.0.1 localhost\n");
    }

    #[test]
    fn test_missing_trailing_newline() {
        let hosts = ResolutionFile::with_path(PathBuf::from("/tmp/hosts"));

        let new_content = hosts.update_content("127.0.0.1 localhost", &[entry("web", 1)], true);

        assert_eq!(
            new_content,
            "127.0.0.1 localhost\n172.22.0.1 web.svc # __vipd_managed\n"
        );
        // Nothing to append, nothing touched.
        assert_eq!(
            hosts.update_content("127.0.0.1 localhost", &[], true),
            "127.0.0.1 localhost"
        );
    }

    #[tokio::test]
    async fn test_rewrite_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "# static\r\n10.0.0.1 db\r\n").unwrap();
        let hosts = ResolutionFile::with_path(path.clone());

        hosts.rewrite(&[entry("web", 1)], true).await.unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        hosts.rewrite(&[entry("web", 1)], true).await.unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
        assert!(first.starts_with("# static\r\n10.0.0.1 db\r\n"));

        hosts.rewrite(&[entry("web", 1)], false).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "# static\r\n10.0.0.1 db\r\n"
        );
    }

    #[tokio::test]
    async fn test_rewrite_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        let hosts = ResolutionFile::with_path(path.clone());

        hosts.rewrite(&[entry("web", 1)], true).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "172.22.0.1 web.svc # __vipd_managed\n"
        );
    }

    fn unmanaged_line() -> impl Strategy<Value = String> {
        "[a-z0-9 .:#\t]{0,30}".prop_filter("managed marker", |l| !l.contains(MANAGED_MARKER))
    }

    proptest! {
        #[test]
        fn unmanaged_lines_survive_in_order(lines in proptest::collection::vec(unmanaged_line(), 0..12)) {
            let hosts = ResolutionFile::with_path(PathBuf::from("/tmp/hosts"));
            let content: String = lines.iter().map(|l| format!("{l}\n")).collect();
            let entries = vec![entry("web", 1), entry("db", 7)];

            let once = hosts.update_content(&content, &entries, true);
            let twice = hosts.update_content(&once, &entries, true);

            prop_assert_eq!(&once, &twice);
            prop_assert!(once.starts_with(&content));
            prop_assert_eq!(hosts.update_content(&once, &entries, false), content);
        }
    }
}
