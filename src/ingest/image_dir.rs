#![cfg(feature = "ingest-image")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::frame::{Frame, FrameSource, SourceStats};

/// Replays JPEG/PNG stills from a local directory in lexical order,
/// looping back to the first file after the last.
pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next_index: usize,
    frame_count: u64,
    last_error: bool,
}

impl ImageDirSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            files: Vec::new(),
            next_index: 0,
            frame_count: 0,
            last_error: false,
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

fn is_still(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            ext == "jpg" || ext == "jpeg" || ext == "png"
        })
        .unwrap_or(false)
}

fn decode(path: &Path) -> Result<Frame> {
    let image = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Frame::new(image.into_raw(), width, height)
}

impl FrameSource for ImageDirSource {
    fn connect(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_still(&path) {
                files.push(path);
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(anyhow!("no jpeg/png files in {}", self.dir.display()));
        }
        log::info!(
            "ImageDirSource: {} stills in {}",
            files.len(),
            self.dir.display()
        );
        self.files = files;
        self.next_index = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if self.files.is_empty() {
            return Err(anyhow!("image directory source is not connected"));
        }
        let path = &self.files[self.next_index];
        self.next_index = (self.next_index + 1) % self.files.len();
        let frame = decode(path);
        self.last_error = frame.is_err();
        let frame = frame?;
        self.frame_count += 1;
        Ok(frame)
    }

    fn is_healthy(&self) -> bool {
        !self.files.is_empty() && !self.last_error
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: format!("dir://{}", self.dir.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_stills_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut first = image::RgbImage::new(4, 2);
        first.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        first.save(dir.path().join("a.png"))?;
        image::RgbImage::new(3, 3).save(dir.path().join("b.png"))?;
        std::fs::write(dir.path().join("notes.txt"), b"skip me")?;

        let mut source = ImageDirSource::new(dir.path());
        source.connect()?;
        assert_eq!(source.files().len(), 2);

        let a = source.next_frame()?;
        assert_eq!((a.width(), a.height()), (4, 2));
        assert_eq!(a.pixel(0, 0), [255, 0, 0]);
        let b = source.next_frame()?;
        assert_eq!((b.width(), b.height()), (3, 3));
        let again = source.next_frame()?;
        assert_eq!(again, a);
        assert_eq!(source.stats().frames_captured, 3);
        Ok(())
    }

    #[test]
    fn empty_directory_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ImageDirSource::new(dir.path());
        assert!(source.connect().is_err());
        assert!(source.next_frame().is_err());
    }
}
