// --- File: src/axons/im2col.rs ---

//! Image-to-column reformatting: the internal collaborator of the
//! convolutional axons.
//!
//! Converts a spatial activation (features x examples, channel-major
//! feature indexing `f = c*(h*w) + y*w + x`) into the column layout
//! consumable by a single matrix multiply, and converts results back.
//!
//! Column layout:
//! - row index: `c * (kh*kw) + ky * kw + kx`
//! - column index: `e * (oh*ow) + oy * ow + ox` (example-major)
//!
//! Positions that fall into the zero padding contribute zeroes on the way
//! in and are skipped on the way back.

use crate::axons::conv::ConvolutionConfig;
use crate::neurons::Neurons3D;
use ndarray::{Array2, ArrayView2};

/// Output spatial dimensions `(out_height, out_width)` for a convolution
/// window sliding over `shape`.
pub fn output_dimensions(shape: &Neurons3D, config: &ConvolutionConfig) -> (usize, usize) {
    let (kh, kw) = config.kernel_size;
    let (sh, sw) = config.stride;
    let (ph, pw) = config.padding;
    let out_h = (shape.height + 2 * ph - kh) / sh + 1;
    let out_w = (shape.width + 2 * pw - kw) / sw + 1;
    (out_h, out_w)
}

/// Reformats spatial images into window columns.
///
/// `images` must be oriented features-in-rows; the result has shape
/// `(depth * kh * kw, out_h * out_w * examples)`.
pub fn images_to_columns(
    images: ArrayView2<'_, f32>,
    shape: &Neurons3D,
    config: &ConvolutionConfig,
) -> Array2<f32> {
    let (kh, kw) = config.kernel_size;
    let (sh, sw) = config.stride;
    let (ph, pw) = config.padding;
    let (out_h, out_w) = output_dimensions(shape, config);
    let examples = images.ncols();
    let window_count = out_h * out_w;

    let mut columns = Array2::<f32>::zeros((shape.depth * kh * kw, window_count * examples));
    for e in 0..examples {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let column = e * window_count + oy * out_w + ox;
                for c in 0..shape.depth {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = (oy * sh + ky) as isize - ph as isize;
                            let ix = (ox * sw + kx) as isize - pw as isize;
                            if iy < 0
                                || iy >= shape.height as isize
                                || ix < 0
                                || ix >= shape.width as isize
                            {
                                continue;
                            }
                            let feature =
                                c * (shape.height * shape.width) + iy as usize * shape.width + ix as usize;
                            let row = c * (kh * kw) + ky * kw + kx;
                            columns[[row, column]] = images[[feature, e]];
                        }
                    }
                }
            }
        }
    }
    columns
}

/// Folds window columns back into spatial images, accumulating overlapping
/// window contributions. Inverse counterpart of [`images_to_columns`] for
/// the backward pass.
pub fn columns_to_images(
    columns: &Array2<f32>,
    shape: &Neurons3D,
    config: &ConvolutionConfig,
    examples: usize,
) -> Array2<f32> {
    let (kh, kw) = config.kernel_size;
    let (sh, sw) = config.stride;
    let (ph, pw) = config.padding;
    let (out_h, out_w) = output_dimensions(shape, config);
    let window_count = out_h * out_w;

    let mut images = Array2::<f32>::zeros((shape.neuron_count(), examples));
    for e in 0..examples {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let column = e * window_count + oy * out_w + ox;
                for c in 0..shape.depth {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = (oy * sh + ky) as isize - ph as isize;
                            let ix = (ox * sw + kx) as isize - pw as isize;
                            if iy < 0
                                || iy >= shape.height as isize
                                || ix < 0
                                || ix >= shape.width as isize
                            {
                                continue;
                            }
                            let feature =
                                c * (shape.height * shape.width) + iy as usize * shape.width + ix as usize;
                            let row = c * (kh * kw) + ky * kw + kx;
                            images[[feature, e]] += columns[[row, column]];
                        }
                    }
                }
            }
        }
    }
    images
}

/// Reorders a `(channels, windows * examples)` multiply result into the
/// feature-major activation layout `(channels * windows, examples)`.
pub fn columns_to_features(
    columns: ArrayView2<'_, f32>,
    channels: usize,
    window_count: usize,
    examples: usize,
) -> Array2<f32> {
    let mut features = Array2::<f32>::zeros((channels * window_count, examples));
    for e in 0..examples {
        for c in 0..channels {
            for p in 0..window_count {
                features[[c * window_count + p, e]] = columns[[c, e * window_count + p]];
            }
        }
    }
    features
}

/// Inverse of [`columns_to_features`]: spreads a feature-major activation
/// back into the `(channels, windows * examples)` column layout.
pub fn features_to_columns(
    features: ArrayView2<'_, f32>,
    channels: usize,
    window_count: usize,
    examples: usize,
) -> Array2<f32> {
    let mut columns = Array2::<f32>::zeros((channels, window_count * examples));
    for e in 0..examples {
        for c in 0..channels {
            for p in 0..window_count {
                columns[[c, e * window_count + p]] = features[[c * window_count + p, e]];
            }
        }
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_output_dimensions_with_padding() {
        let shape = Neurons3D::new(4, 4, 1, false);
        let config = ConvolutionConfig::new((3, 3)).with_padding((1, 1));
        assert_eq!(output_dimensions(&shape, &config), (4, 4));
    }

    #[test]
    fn test_images_to_columns_2x2_window() {
        // Одна картинка 3x3, один канал, окно 2x2, stride 1.
        let shape = Neurons3D::new(3, 3, 1, false);
        let config = ConvolutionConfig::new((2, 2));
        let images = array![[0.0], [1.0], [2.0], [3.0], [4.0], [5.0], [6.0], [7.0], [8.0]];

        let columns = images_to_columns(images.view(), &shape, &config);
        assert_eq!(columns.dim(), (4, 4));
        // Первое окно: элементы (0,0),(0,1),(1,0),(1,1) -> 0,1,3,4.
        assert_eq!(columns.column(0).to_vec(), vec![0.0, 1.0, 3.0, 4.0]);
        // Последнее окно: 4,5,7,8.
        assert_eq!(columns.column(3).to_vec(), vec![4.0, 5.0, 7.0, 8.0]);
    }

    #[test]
    fn test_columns_round_trip_accumulates_overlaps() {
        let shape = Neurons3D::new(3, 3, 1, false);
        let config = ConvolutionConfig::new((2, 2));
        let images = Array2::from_shape_fn((9, 1), |(f, _)| f as f32);

        let columns = images_to_columns(images.view(), &shape, &config);
        let back = columns_to_images(&columns, &shape, &config, 1);
        // Центральный пиксель (признак 4) входит во все 4 окна.
        assert_eq!(back[[4, 0]], 4.0 * 4.0);
        // Угловой (признак 0) - только в одно.
        assert_eq!(back[[0, 0]], 0.0);
        assert_eq!(back[[8, 0]], 8.0);
    }

    #[test]
    fn test_feature_column_reordering_round_trip() {
        let columns = array![[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]];
        // 2 канала, 2 окна, 2 примера.
        let features = columns_to_features(columns.view(), 2, 2, 2);
        assert_eq!(features.dim(), (4, 2));
        assert_eq!(features.column(0).to_vec(), vec![1.0, 2.0, 5.0, 6.0]);
        assert_eq!(features.column(1).to_vec(), vec![3.0, 4.0, 7.0, 8.0]);

        let back = features_to_columns(features.view(), 2, 2, 2);
        assert_eq!(back, columns);
    }
}
