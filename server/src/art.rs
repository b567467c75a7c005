//! Filesystem-backed art/asset store (§1 "out of scope" collaborator):
//! GID -> byte blob, read from `<root>/<display>.art`.

use p3core::ports::ArtStore;
use protocol::gid::format_display;
use std::path::PathBuf;

pub struct FilesystemArtStore {
    root: PathBuf,
}

impl FilesystemArtStore {
    pub fn new(root: PathBuf) -> Self {
        FilesystemArtStore { root }
    }
}

impl ArtStore for FilesystemArtStore {
    fn get(&self, gid: u32) -> Option<Vec<u8>> {
        let display = format_display(gid);
        std::fs::read(self.root.join(format!("{display}.art"))).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_blob_named_by_gid_display() {
        let dir = std::env::temp_dir().join(format!("p3-art-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut f = std::fs::File::create(dir.join("1-0-1333.art")).unwrap();
        f.write_all(b"pixels").unwrap();

        let store = FilesystemArtStore::new(dir.clone());
        assert_eq!(store.get(0x01000535), Some(b"pixels".to_vec()));
        assert_eq!(store.get(0xDEADBEEF), None);

        std::fs::remove_dir_all(&dir).ok();
    }
}
