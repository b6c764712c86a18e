//! Grayscale capture checks: brightness, dark detection, quality.

/// Average pixel brightness (0.0–255.0).
pub fn avg_brightness(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 0.0;
    }
    gray.iter().map(|&b| b as f32).sum::<f32>() / gray.len() as f32
}

/// Population standard deviation of pixel values.
pub fn contrast(gray: &[u8]) -> f32 {
    if gray.is_empty() {
        return 0.0;
    }
    let mean = avg_brightness(gray);
    let var = gray
        .iter()
        .map(|&b| {
            let d = b as f32 - mean;
            d * d
        })
        .sum::<f32>()
        / gray.len() as f32;
    var.sqrt()
}

/// True if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

/// Capture quality in [0, 1]: half exposure (distance of mean brightness
/// from mid-gray), half contrast (saturating at a standard deviation of 64).
pub fn quality(gray: &[u8]) -> f32 {
    let exposure = 1.0 - ((avg_brightness(gray) - 128.0).abs() / 128.0);
    let spread = (contrast(gray) / 64.0).min(1.0);
    (0.5 * exposure.clamp(0.0, 1.0) + 0.5 * spread).clamp(0.0, 1.0)
}
