use std::path::Path;

use burn::tensor::backend::Backend;
use burn::tensor::{Data, ElementConversion, Int, Shape, Tensor};
use image::{Rgb, RgbImage};

use crate::error::{DiffusionError, Result};

/// Images per grid row.
pub const GRID_ROW: usize = 8;
/// Zero padding around each grid cell, in pixels.
pub const GRID_PADDING: usize = 2;

/// Converts an RGB frame into a `[1, 3, height, width]` tensor in `[0, 1]`.
pub fn image_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = image.dimensions();
    let (width, height) = (width as usize, height as usize);
    let mut values: Vec<B::FloatElem> = Vec::with_capacity(3 * width * height);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let pixel = image.get_pixel(x as u32, y as u32);
                values.push((pixel[channel] as f64 / 255.0).elem());
            }
        }
    }

    Tensor::from_data(Data::new(values, Shape::new([1, 3, height, width])), device)
}

/// Tiles a batch of `[0, 255]` RGB images into a single frame.
pub fn make_grid<B: Backend>(images: Tensor<B, 4, Int>) -> Result<RgbImage> {
    let [batch, channels, height, width] = images.dims();
    if channels != 3 {
        return Err(DiffusionError::ShapeMismatch {
            what: "grid channels",
            expected: 3,
            actual: channels,
        });
    }

    let columns = batch.clamp(1, GRID_ROW);
    let rows = (batch + columns - 1) / columns;
    let cell_width = width + GRID_PADDING;
    let cell_height = height + GRID_PADDING;
    let mut grid = RgbImage::new(
        (columns * cell_width + GRID_PADDING) as u32,
        (rows.max(1) * cell_height + GRID_PADDING) as u32,
    );

    let values = images.into_data().convert::<i64>().value;
    let plane = height * width;
    for index in 0..batch {
        let x0 = (index % columns) * cell_width + GRID_PADDING;
        let y0 = (index / columns) * cell_height + GRID_PADDING;
        let base = index * 3 * plane;
        for y in 0..height {
            for x in 0..width {
                let offset = base + y * width + x;
                let pixel = [0, 1, 2].map(|c| values[offset + c * plane].clamp(0, 255) as u8);
                grid.put_pixel((x0 + x) as u32, (y0 + y) as u32, Rgb(pixel));
            }
        }
    }

    Ok(grid)
}

/// Writes a batch of `[0, 255]` RGB images to `path` as one grid.
pub fn save_images<B: Backend>(images: Tensor<B, 4, Int>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let grid = make_grid(images)?;
    grid.save(path)?;
    tracing::debug!(path = %path.display(), "saved image grid");

    Ok(())
}
