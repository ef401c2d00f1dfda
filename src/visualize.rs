// visualize.rs

use crate::augment::denormalize_chw;
use crate::error::{Error, IoContext, Result};
use crate::loader::{Batch, DataLoader};
use image::RgbImage;
use std::fs;
use std::path::Path;
use tch::{Device, Kind};

/// Lays out a batch in a grid of `nrow` columns, undoing the normalization
/// so the images look as the network's input would if viewed.
pub fn batch_grid(batch: &Batch, nrow: usize) -> Result<RgbImage> {
    let size = batch.images.size();
    let (n, height, width) = (size[0] as usize, size[2] as u32, size[3] as u32);
    let nrow = nrow.max(1);
    let ncol = n.div_ceil(nrow);

    let mut grid = RgbImage::new(width * nrow as u32, height * ncol.max(1) as u32);
    for idx in 0..n {
        let chw = Vec::<f32>::try_from(
            &batch
                .images
                .get(idx as i64)
                .to_device(Device::Cpu)
                .to_kind(Kind::Float)
                .contiguous()
                .view([-1]),
        )?;
        let tile = denormalize_chw(&chw, width);
        let (x0, y0) = ((idx % nrow) as u32 * width, (idx / nrow) as u32 * height);
        for (x, y, px) in tile.enumerate_pixels() {
            grid.put_pixel(x0 + x, y0 + y, *px);
        }
    }
    Ok(grid)
}

/// Saves the first batch of a pass as a PNG grid.
pub fn visualize_batch(loader: &mut DataLoader, path: &Path) -> Result<usize> {
    let batch = loader
        .iter()?
        .next()
        .ok_or_else(|| Error::EmptySplit(path.to_path_buf()))??;
    let grid = batch_grid(&batch, 8)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).at(parent)?;
    }
    grid.save(path).map_err(|source| Error::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!("batch preview saved to {}", path.display());
    Ok(batch.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::EvalTransform;
    use crate::category::Category;
    use crate::loader::{LoaderOptions, Sample};
    use image::Rgb;
    use std::sync::Arc;

    #[test]
    fn grid_has_one_tile_per_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut samples = Vec::new();
        for i in 0..10u8 {
            let path = dir.path().join(format!("{i}.png"));
            RgbImage::from_pixel(8, 8, Rgb([i * 20, 100, 200])).save(&path).unwrap();
            samples.push(Sample {
                path,
                category: Category::Paper,
            });
        }
        let mut loader = DataLoader::new(
            samples,
            Arc::new(EvalTransform::new(8)),
            LoaderOptions {
                batch_size: 10,
                shuffle: false,
                workers: 2,
                prefetch_depth: 1,
                seed: 1,
            },
        )
        .unwrap();

        let out = dir.path().join("preview").join("batch.png");
        assert_eq!(visualize_batch(&mut loader, &out).unwrap(), 10);
        let grid = image::open(&out).unwrap().into_rgb8();
        assert_eq!(grid.dimensions(), (64, 16));
        assert_eq!(grid.get_pixel(8 * 3, 0), &Rgb([60, 100, 200]));
        // unused cells stay black
        assert_eq!(grid.get_pixel(63, 15), &Rgb([0, 0, 0]));
    }
}
