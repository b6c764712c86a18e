//! Feature layout over a square grayscale patch.
//!
//! | range  | feature                                         |
//! |--------|-------------------------------------------------|
//! | 0..16  | intensity histogram, 16 bins, normalized        |
//! | 16..21 | mean, std, min, max, median (÷255)              |
//! | 21..25 | mean/std of x and y gradients (÷255)            |
//! | 25..33 | gradient magnitude histogram, 8 bins, normalized |
//! | 33..49 | variance of each 4×4 grid cell (÷255²)          |
//! | 49..64 | zero                                            |

pub const FEATURE_DIM: usize = 64;

const EPS: f32 = 1e-7;

#[derive(Clone, Copy)]
enum Axis {
    X,
    Y,
}

/// Compute the feature vector for an `n`×`n` patch of pixel values in 0–255.
pub fn compute(pixels: &[f32], n: usize) -> Vec<f32> {
    let mut features = Vec::with_capacity(FEATURE_DIM);

    features.extend(histogram(pixels, 16, 256.0));
    features.extend(stats(pixels));

    let gx = gradient(pixels, n, Axis::X);
    let gy = gradient(pixels, n, Axis::Y);
    let (mx, sx) = mean_std(&gx);
    let (my, sy) = mean_std(&gy);
    features.extend([mx / 255.0, sx / 255.0, my / 255.0, sy / 255.0]);

    let magnitude: Vec<f32> = gx.iter().zip(&gy).map(|(a, b)| (a * a + b * b).sqrt()).collect();
    features.extend(histogram(&magnitude, 8, 256.0));

    features.extend(cell_variances(pixels, n, 4));

    features.resize(FEATURE_DIM, 0.0);
    features
}

/// Normalized histogram with `bins` equal bins over `[0, upper]`.
/// Values outside the range are not counted.
fn histogram(values: &[f32], bins: usize, upper: f32) -> Vec<f32> {
    let width = upper / bins as f32;
    let mut counts = vec![0u32; bins];
    for &v in values {
        if !(0.0..=upper).contains(&v) {
            continue;
        }
        let bin = ((v / width) as usize).min(bins - 1);
        counts[bin] += 1;
    }
    let total: u32 = counts.iter().sum();
    counts
        .into_iter()
        .map(|c| c as f32 / (total as f32 + EPS))
        .collect()
}

fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, var.sqrt())
}

fn stats(pixels: &[f32]) -> [f32; 5] {
    let (mean, std) = mean_std(pixels);
    let mut sorted = pixels.to_vec();
    sorted.sort_by(f32::total_cmp);
    let (min, max, median) = match sorted.len() {
        0 => (0.0, 0.0, 0.0),
        len if len % 2 == 0 => (
            sorted[0],
            sorted[len - 1],
            (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0,
        ),
        len => (sorted[0], sorted[len - 1], sorted[len / 2]),
    };
    [mean, std, min, max, median].map(|v| v / 255.0)
}

/// Central differences in the interior, one-sided differences at the borders.
fn gradient(pixels: &[f32], n: usize, axis: Axis) -> Vec<f32> {
    let mut out = vec![0.0; pixels.len()];
    if n < 2 {
        return out;
    }
    let stride = match axis {
        Axis::X => 1,
        Axis::Y => n,
    };
    for y in 0..n {
        for x in 0..n {
            let i = y * n + x;
            let pos = match axis {
                Axis::X => x,
                Axis::Y => y,
            };
            out[i] = if pos == 0 {
                pixels[i + stride] - pixels[i]
            } else if pos == n - 1 {
                pixels[i] - pixels[i - stride]
            } else {
                (pixels[i + stride] - pixels[i - stride]) / 2.0
            };
        }
    }
    out
}

/// Variance of each cell in a `grid`×`grid` partition, row-major.
fn cell_variances(pixels: &[f32], n: usize, grid: usize) -> Vec<f32> {
    let cell = n / grid;
    let mut out = Vec::with_capacity(grid * grid);
    for row in 0..grid {
        for col in 0..grid {
            let mut patch = Vec::with_capacity(cell * cell);
            for y in row * cell..(row + 1) * cell {
                patch.extend_from_slice(&pixels[y * n + col * cell..y * n + (col + 1) * cell]);
            }
            let (_, std) = mean_std(&patch);
            out.push(std * std / (255.0 * 255.0));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_edges_and_interior() {
        // 3x3, values increase by 10 along x and 1 along y.
        let p: Vec<f32> = (0..3)
            .flat_map(|y| (0..3).map(move |x| (x * 10 + y) as f32))
            .collect();
        assert!(gradient(&p, 3, Axis::X).iter().all(|&g| g == 10.0));
        assert!(gradient(&p, 3, Axis::Y).iter().all(|&g| g == 1.0));
    }

    #[test]
    fn test_histogram_normalized_and_bounded() {
        let h = histogram(&[0.0, 15.9, 16.0, 255.0, 256.0, 300.0], 16, 256.0);
        assert_eq!(h.len(), 16);
        let total: f32 = h.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!((h[0] - 0.4).abs() < 1e-5);
        assert!((h[15] - 0.4).abs() < 1e-5);
    }

    #[test]
    fn test_stats_median_even_length() {
        let s = stats(&[0.0, 51.0, 102.0, 255.0]);
        assert_eq!(s[2], 0.0);
        assert_eq!(s[3], 1.0);
        assert!((s[4] - 76.5 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_layout_length_and_padding() {
        let n = 8;
        let p: Vec<f32> = (0..n * n).map(|i| (i * 4) as f32).collect();
        let f = compute(&p, n);
        assert_eq!(f.len(), FEATURE_DIM);
        assert!(f[49..].iter().all(|&v| v == 0.0));
        assert!(f[33..49].iter().all(|&v| v > 0.0));
    }
}
