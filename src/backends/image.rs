//! Image display backend.
//!
//! Holds a display window split into frames. Each frame shows one image
//! and carries an optional region of interest and count limits, which
//! together define the `COUNT` average.
//!
//! ```text
//! FRAME [n]                  get or recreate n frames
//! TEST i [k]                 show synthetic test image k in frame i
//! IMAGE i [path...]          show an image file in frame i
//! RECT i [left top w h]      region of interest (-1 -1 -1 -1 clears)
//! LIMIT i [lower upper]      count limits
//! COUNT i                    mean pixel value within region and limits
//! ```
//!
//! Device error codes: 1 no such frame, 2 file not readable, 3 no image
//! loaded, 4 no pixels in region.

use crate::command::{rest, Response};
use crate::dispatcher::{arg, CommandTable, Dispatcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound for `FRAME n`.
pub const MAX_FRAMES: usize = 64;

/// Side length of synthetic test images.
pub const TEST_IMAGE_SIZE: usize = 64;

const ERR_NO_FRAME: i32 = 1;
const ERR_NO_FILE_ACCESS: i32 = 2;
const ERR_NO_IMAGE: i32 = 3;
const ERR_EMPTY_REGION: i32 = 4;

/// Printed for values that were never set.
const UNSET: &str = "-";

/// Image loading errors
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("cannot read '{}': {source}", path.display())]
    Access {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid image '{}' at line {line}: {reason}", path.display())]
    Format {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("image '{}' has no pixels", .0.display())]
    Empty(PathBuf),
}

/// A grayscale image in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: usize,
    height: usize,
    pixels: Vec<f64>,
}

impl Image {
    /// Build from row-major pixels. `None` if the size does not match.
    pub fn new(width: usize, height: usize, pixels: Vec<f64>) -> Option<Self> {
        (width > 0 && height > 0 && pixels.len() == width * height).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    /// Deterministic diagonal ramp used by `TEST`.
    pub fn test_pattern(index: u32) -> Self {
        let n = TEST_IMAGE_SIZE;
        let pixels = (0..n * n)
            .map(|i| ((i % n + i / n + index as usize) % 100) as f64)
            .collect();
        Self {
            width: n,
            height: n,
            pixels,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Mean of the pixels inside `rect` whose values fall within `limits`.
    ///
    /// Returns `None` when no pixel qualifies.
    pub fn mean(&self, rect: Option<Rect>, limits: Option<CountLimits>) -> Option<f64> {
        let (x0, y0, x1, y1) = match rect {
            Some(rect) => rect.clip(self.width, self.height)?,
            None => (0, 0, self.width, self.height),
        };

        let mut sum = 0.0;
        let mut count = 0usize;
        for y in y0..y1 {
            for &value in &self.pixels[y * self.width + x0..y * self.width + x1] {
                if limits.map_or(true, |l| l.contains(value)) {
                    sum += value;
                    count += 1;
                }
            }
        }
        (count > 0).then(|| sum / count as f64)
    }
}

/// Region of interest in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: i64,
    pub top: i64,
    pub width: i64,
    pub height: i64,
}

impl Rect {
    /// Intersect with an image, returning `(x0, y0, x1, y1)` if non-empty.
    fn clip(&self, width: usize, height: usize) -> Option<(usize, usize, usize, usize)> {
        let x0 = self.left.max(0);
        let y0 = self.top.max(0);
        let x1 = self.left.saturating_add(self.width).min(width as i64);
        let y1 = self.top.saturating_add(self.height).min(height as i64);
        (x0 < x1 && y0 < y1).then_some((x0 as usize, y0 as usize, x1 as usize, y1 as usize))
    }
}

/// Inclusive pixel value bounds for averaging.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountLimits {
    pub lower: f64,
    pub upper: f64,
}

impl CountLimits {
    fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Source of images for `IMAGE`.
pub trait ImageReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<Image, ImageError>;
}

/// Reads plain-text matrices: one row per line, whitespace-separated
/// values, `#` comments.
pub struct TextImageReader;

impl ImageReader for TextImageReader {
    fn read(&self, path: &Path) -> Result<Image, ImageError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ImageError::Access {
            path: path.to_path_buf(),
            source,
        })?;
        parse_text_image(path, &contents)
    }
}

fn parse_text_image(path: &Path, contents: &str) -> Result<Image, ImageError> {
    let format_error = |line: usize, reason: String| ImageError::Format {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut pixels = Vec::new();
    let mut width = 0;
    let mut height = 0;

    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format_error(i + 1, e.to_string()))?;

        if height == 0 {
            width = row.len();
        } else if row.len() != width {
            return Err(format_error(
                i + 1,
                format!("expected {width} values, found {}", row.len()),
            ));
        }
        pixels.extend(row);
        height += 1;
    }

    Image::new(width, height, pixels).ok_or_else(|| ImageError::Empty(path.to_path_buf()))
}

/// Path recorded for synthetic test image `k`.
fn test_image_path(k: u32) -> String {
    format!("test_{:06}", u64::from(k) + 10001)
}

#[derive(Debug, Default, Clone)]
struct FrameSlot {
    image: Option<Arc<Image>>,
    path: Option<String>,
    rect: Option<Rect>,
    limits: Option<CountLimits>,
}

#[derive(Debug)]
struct Display {
    frames: Vec<FrameSlot>,
    open: bool,
}

/// Image display server
pub struct ImageServer {
    base_dir: PathBuf,
    reader: Box<dyn ImageReader>,
    display: Mutex<Display>,
    commands: CommandTable<ImageServer>,
}

impl ImageServer {
    /// Open the display with `initial_frames` empty frames.
    pub fn new(base_dir: PathBuf, reader: Box<dyn ImageReader>, initial_frames: usize) -> Self {
        let commands = CommandTable::new()
            .register("FRAME", Self::frame)
            .register("TEST", Self::test)
            .register("IMAGE", Self::image)
            .register("RECT", Self::rect)
            .register("LIMIT", Self::limit)
            .register("COUNT", Self::count);

        let server = Self {
            base_dir,
            reader,
            display: Mutex::new(Display {
                frames: Vec::new(),
                open: true,
            }),
            commands,
        };
        if initial_frames > MAX_FRAMES {
            warn!(
                requested = initial_frames,
                max = MAX_FRAMES,
                "Too many initial frames, opening the maximum"
            );
        }
        server.set_frame_count(initial_frames.min(MAX_FRAMES));

        info!(
            base_dir = %server.base_dir.display(),
            frames = server.frame_count(),
            commands = ?server.commands.names(),
            "Display opened"
        );
        server
    }

    pub fn frame_count(&self) -> usize {
        self.display().frames.len()
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.display().open
    }

    fn display(&self) -> MutexGuard<'_, Display> {
        self.display.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace all frames with `n` empty ones.
    fn set_frame_count(&self, n: usize) {
        self.display().frames = vec![FrameSlot::default(); n];
    }

    fn with_frame<T>(&self, index: usize, f: impl FnOnce(&mut FrameSlot) -> T) -> Result<T, i32> {
        self.display()
            .frames
            .get_mut(index)
            .map(f)
            .ok_or(ERR_NO_FRAME)
    }

    fn show(&self, index: usize, image: Image, path: String) -> Result<(), i32> {
        self.with_frame(index, |slot| {
            slot.image = Some(Arc::new(image));
            slot.path = Some(path);
        })
    }

    fn path_response(&self, verb: &str, index: usize) -> Response {
        match self.with_frame(index, |slot| slot.path.clone()) {
            Ok(path) => Response::ok(format!(
                "{verb} {index} {}",
                path.as_deref().unwrap_or(UNSET)
            )),
            Err(code) => Response::error(code, format!("{verb} {index}")),
        }
    }

    fn frame(&self, args: &[String]) -> Response {
        match args.len() {
            0 => Response::ok(format!("get_frame {}", self.frame_count())),
            1 => match arg::<usize>(args, 0) {
                Some(n) if n <= MAX_FRAMES => {
                    self.set_frame_count(n);
                    debug!(frames = n, "Frames recreated");
                    Response::ok(format!("set_frame {n}"))
                }
                _ => Response::illegal_arguments("frame"),
            },
            _ => Response::illegal_arguments("frame"),
        }
    }

    fn test(&self, args: &[String]) -> Response {
        let Some(index) = arg::<usize>(args, 0) else {
            return Response::illegal_arguments("test");
        };
        match args.len() {
            1 => self.path_response("get_test", index),
            2 => {
                let Some(k) = arg::<u32>(args, 1) else {
                    return Response::illegal_arguments("test");
                };
                match self.show(index, Image::test_pattern(k), test_image_path(k)) {
                    Ok(()) => Response::ok(format!("set_test {index} {k}")),
                    Err(code) => Response::error(code, format!("set_test {index} {k}")),
                }
            }
            _ => Response::illegal_arguments("test"),
        }
    }

    fn image(&self, args: &[String]) -> Response {
        let Some(index) = arg::<usize>(args, 0) else {
            return Response::illegal_arguments("image");
        };
        if args.len() == 1 {
            return self.path_response("get_image", index);
        }

        let path = rest(args, 1);
        let message = format!("set_image {index} {path}");
        if let Err(code) = self.with_frame(index, |_| ()) {
            return Response::error(code, message);
        }

        // Read outside the display lock; files may live on slow shares.
        let image = match self.reader.read(&self.base_dir.join(&path)) {
            Ok(image) => image,
            Err(e) => {
                debug!(error = %e, "Image load failed");
                return Response::error(ERR_NO_FILE_ACCESS, message);
            }
        };
        debug!(
            frame = index,
            width = image.width(),
            height = image.height(),
            "Image loaded"
        );

        match self.show(index, image, path) {
            Ok(()) => Response::ok(message),
            Err(code) => Response::error(code, message),
        }
    }

    fn rect(&self, args: &[String]) -> Response {
        let Some(index) = arg::<usize>(args, 0) else {
            return Response::illegal_arguments("rect");
        };
        match args.len() {
            1 => match self.with_frame(index, |slot| slot.rect) {
                Ok(rect) => {
                    let (l, t, w, h) = rect.map_or((-1, -1, -1, -1), |r| (r.left, r.top, r.width, r.height));
                    Response::ok(format!("get_rect {index} {l} {t} {w} {h}"))
                }
                Err(code) => Response::error(code, format!("get_rect {index}")),
            },
            5 => {
                let values: Option<Vec<i64>> = (1..5).map(|i| arg::<i64>(args, i)).collect();
                let Some(&[left, top, width, height]) = values.as_deref() else {
                    return Response::illegal_arguments("rect");
                };
                let rect = ([left, top, width, height] != [-1; 4]).then_some(Rect {
                    left,
                    top,
                    width,
                    height,
                });
                let message = format!("set_rect {index} {left} {top} {width} {height}");
                match self.with_frame(index, |slot| slot.rect = rect) {
                    Ok(()) => Response::ok(message),
                    Err(code) => Response::error(code, message),
                }
            }
            _ => Response::illegal_arguments("rect"),
        }
    }

    fn limit(&self, args: &[String]) -> Response {
        let Some(index) = arg::<usize>(args, 0) else {
            return Response::illegal_arguments("limit");
        };
        match args.len() {
            1 => match self.with_frame(index, |slot| slot.limits) {
                Ok(Some(limits)) => Response::ok(format!(
                    "get_limit {index} {} {}",
                    limits.lower, limits.upper
                )),
                Ok(None) => Response::ok(format!("get_limit {index} {UNSET} {UNSET}")),
                Err(code) => Response::error(code, format!("get_limit {index}")),
            },
            3 => {
                let (Some(lower), Some(upper)) = (arg::<f64>(args, 1), arg::<f64>(args, 2)) else {
                    return Response::illegal_arguments("limit");
                };
                if lower.is_nan() || upper.is_nan() {
                    return Response::illegal_arguments("limit");
                }
                let message = format!("set_limit {index} {lower} {upper}");
                match self.with_frame(index, |slot| {
                    slot.limits = Some(CountLimits { lower, upper })
                }) {
                    Ok(()) => Response::ok(message),
                    Err(code) => Response::error(code, message),
                }
            }
            _ => Response::illegal_arguments("limit"),
        }
    }

    fn count(&self, args: &[String]) -> Response {
        let (1, Some(index)) = (args.len(), arg::<usize>(args, 0)) else {
            return Response::illegal_arguments("count");
        };
        let message = format!("get_count {index}");

        let slot = match self.with_frame(index, |slot| slot.clone()) {
            Ok(slot) => slot,
            Err(code) => return Response::error(code, message),
        };
        let Some(image) = slot.image else {
            return Response::error(ERR_NO_IMAGE, message);
        };

        match image.mean(slot.rect, slot.limits) {
            Some(mean) => Response::ok(format!("{message} {mean}")),
            None => Response::error(ERR_EMPTY_REGION, message),
        }
    }
}

impl Dispatcher for ImageServer {
    fn process(&self, name: &str, args: &[String]) -> Response {
        self.commands.dispatch(self, name, args)
    }

    fn close(&self) {
        let mut display = self.display();
        if display.open {
            display.frames.clear();
            display.open = false;
            info!("Display closed");
        }
    }
}
