//! Image transfer to display-capable slider boxes
//!
//! The device asks with `REQ`; the host answers with `IMG\n`, a big-endian
//! payload length and the raw pixels (RGB888, or big-endian RGB565 for
//! TFT firmwares) streamed one row at a time so the board's small receive
//! buffer keeps up. An optional caption line follows the pixels.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::DeviceSink;
use crate::config::PixelFormat;
use crate::protocol::image_header;

/// Pause between the header and the first row
const HEADER_PAUSE: Duration = Duration::from_millis(50);

/// Rows between progress log lines
const PROGRESS_EVERY_ROWS: u32 = 8;

/// Decoded, resized image ready for the wire
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Packed pixels in `format`, row-major
    pub pixels: Vec<u8>,
}

impl PreparedImage {
    pub fn row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }
}

/// Load an image file and resize it to exactly `width` x `height`
pub fn prepare_image(
    path: &Path,
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<PreparedImage> {
    let decoded = image::open(path)
        .with_context(|| format!("Failed to decode image {}", path.display()))?;

    debug!(
        "Loaded {} ({}x{}), resizing to {}x{}",
        path.display(),
        decoded.width(),
        decoded.height(),
        width,
        height
    );

    let rgb = decoded
        .resize_exact(width, height, FilterType::Lanczos3)
        .to_rgb8()
        .into_raw();

    let pixels = match format {
        PixelFormat::Rgb888 => rgb,
        PixelFormat::Rgb565 => rgb888_to_rgb565(&rgb),
    };

    Ok(PreparedImage {
        width,
        height,
        format,
        pixels,
    })
}

/// Pack RGB888 triplets into big-endian RGB565
pub fn rgb888_to_rgb565(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .flat_map(|px| {
            let (r, g, b) = (u16::from(px[0]), u16::from(px[1]), u16::from(px[2]));
            (((r & 0xF8) << 8) | ((g & 0xFC) << 3) | (b >> 3)).to_be_bytes()
        })
        .collect()
}

/// Stream an image to the device, then the caption line if any
///
/// Blocking: run it on a blocking thread, never on the async runtime.
pub fn transmit_image(
    sink: &dyn DeviceSink,
    image: &PreparedImage,
    row_delay: Duration,
    caption: Option<&str>,
) -> Result<()> {
    let payload_len = u32::try_from(image.pixels.len()).context("Image payload too large")?;
    let row_len = image.row_len();
    if row_len == 0 {
        anyhow::bail!("Image has zero width");
    }

    info!(
        "🖼️  Sending {}x{} {:?} image ({} bytes)",
        image.width, image.height, image.format, payload_len
    );

    let header = image_header(payload_len);
    let rows = image.height;
    let caption = caption.map(caption_line);

    // Header and rows go out under one hold so no SET lands mid-frame
    sink.exclusive(&mut |port| {
        port.write_all(&header)?;
        port.flush()?;
        std::thread::sleep(HEADER_PAUSE);

        for (row, chunk) in image.pixels.chunks(row_len).enumerate() {
            let row = row as u32 + 1;
            port.write_all(chunk)?;
            port.flush()?;

            if row % PROGRESS_EVERY_ROWS == 0 {
                debug!("Image progress: {}/{} rows", row, rows);
            }
            if !row_delay.is_zero() {
                std::thread::sleep(row_delay);
            }
        }

        if let Some(line) = &caption {
            port.write_all(line.as_bytes())?;
        }
        Ok(())
    })
    .context("Failed to send image")?;

    info!("Image sent");
    Ok(())
}

/// One newline-terminated caption line; embedded line breaks would end it early
fn caption_line(caption: &str) -> String {
    let mut line: String = caption
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arduino::testing::RecordingSink;
    use crate::protocol::IMAGE_MAGIC;
    use tempfile::TempDir;

    fn write_test_png(dir: &TempDir, width: u32, height: u32) -> std::path::PathBuf {
        let path = dir.path().join("cover.png");
        let img = image::RgbImage::from_fn(width, height, |x, _| {
            if x % 2 == 0 {
                image::Rgb([255, 0, 0])
            } else {
                image::Rgb([0, 0, 255])
            }
        });
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_prepare_image_resizes_to_rgb() {
        let dir = TempDir::new().unwrap();
        let path = write_test_png(&dir, 40, 20);

        let prepared = prepare_image(&path, 10, 8, PixelFormat::Rgb888).unwrap();
        assert_eq!(prepared.width, 10);
        assert_eq!(prepared.height, 8);
        assert_eq!(prepared.pixels.len(), 10 * 8 * 3);
        assert_eq!(prepared.row_len(), 30);

        let packed = prepare_image(&path, 10, 8, PixelFormat::Rgb565).unwrap();
        assert_eq!(packed.pixels.len(), 10 * 8 * 2);
        assert_eq!(packed.row_len(), 20);
    }

    #[test]
    fn test_rgb565_is_big_endian() {
        let packed = rgb888_to_rgb565(&[255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255]);
        assert_eq!(packed, vec![0xF8, 0x00, 0x07, 0xE0, 0x00, 0x1F, 0xFF, 0xFF]);
    }

    #[test]
    fn test_prepare_image_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(prepare_image(&dir.path().join("nope.png"), 10, 10, PixelFormat::Rgb888).is_err());
    }

    #[test]
    fn test_transmit_writes_header_then_rows() {
        let sink = RecordingSink::new();
        let image = PreparedImage {
            width: 2,
            height: 3,
            format: PixelFormat::Rgb888,
            pixels: (0..18).collect(),
        };

        transmit_image(&sink, &image, Duration::ZERO, None).unwrap();

        let writes = sink.raw_writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(&writes[0][..4], IMAGE_MAGIC);
        assert_eq!(&writes[0][4..], &18u32.to_be_bytes());
        assert_eq!(writes[1], vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(writes[3], vec![12, 13, 14, 15, 16, 17]);
    }

    #[test]
    fn test_transmit_rgb565_rows_then_caption() {
        let sink = RecordingSink::new();
        let image = PreparedImage {
            width: 2,
            height: 2,
            format: PixelFormat::Rgb565,
            pixels: (0..8).collect(),
        };

        transmit_image(&sink, &image, Duration::ZERO, Some("Song\tBand\nlive")).unwrap();

        let writes = sink.raw_writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(&writes[0][4..], &8u32.to_be_bytes());
        assert_eq!(writes[1], vec![0, 1, 2, 3]);
        assert_eq!(writes[2], vec![4, 5, 6, 7]);
        assert_eq!(writes[3], b"Song\tBand live\n".to_vec());
    }

    #[test]
    fn test_transmit_stops_on_write_failure() {
        let sink = RecordingSink::new();
        sink.set_failing(true);
        let image = PreparedImage {
            width: 1,
            height: 1,
            format: PixelFormat::Rgb888,
            pixels: vec![1, 2, 3],
        };

        assert!(transmit_image(&sink, &image, Duration::ZERO, None).is_err());
        assert!(sink.raw_writes().is_empty());
    }
}
