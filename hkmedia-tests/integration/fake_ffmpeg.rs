//! Shell scripts standing in for FFmpeg.

use std::fs;
use std::path::{Path, PathBuf};

use hkmedia_core::MediaConfig;
use tempfile::TempDir;

/// A temporary executable that runs `body` under `/bin/sh`.
pub struct FakeFfmpeg {
    dir: TempDir,
    path: PathBuf,
}

impl FakeFfmpeg {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ffmpeg");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }

        Self { dir, path }
    }

    /// Scratch directory that lives as long as the script.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Test configuration pointing at this script.
    pub fn config(&self) -> MediaConfig {
        let mut config = MediaConfig::for_testing();
        config.process.ffmpeg_path = self.path.clone();
        config
    }
}

/// A box of `total_len` bytes with a recognisable fill.
pub fn make_box(box_type: &[u8; 4], total_len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(total_len);
    data.extend_from_slice(&(total_len as u32).to_be_bytes());
    data.extend_from_slice(box_type);
    data.resize(total_len, box_type[3]);
    data
}

/// `ftyp(16) moov(40) moof(24) mdat(100) moof(24) mdat(60)`
pub fn two_fragment_stream() -> Vec<u8> {
    [
        make_box(b"ftyp", 16),
        make_box(b"moov", 40),
        make_box(b"moof", 24),
        make_box(b"mdat", 100),
        make_box(b"moof", 24),
        make_box(b"mdat", 60),
    ]
    .concat()
}
