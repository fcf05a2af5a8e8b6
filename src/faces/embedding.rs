//! Embedding vector math.

use crate::config::DistanceMetric;

/// Largest distance between two unit vectors, under either metric.
pub const MAX_UNIT_DISTANCE: f32 = 2.0;

/// Scale to unit length; `None` for a zero (or non-finite) vector.
pub fn normalize(embedding: &[f32]) -> Option<Vec<f32>> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        Some(embedding.iter().map(|x| x / norm).collect())
    } else {
        None
    }
}

/// Calculate euclidean distance between two face embeddings
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

/// Cosine distance: 0 = identical, 2 = opposite
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return f32::MAX;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        1.0 - dot / (norm_a * norm_b)
    } else {
        f32::MAX
    }
}

pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Euclidean => euclidean_distance(a, b),
        DistanceMetric::Cosine => cosine_distance(a, b),
    }
}

/// Map a distance to [0, 1]; 1 for identical faces, decreasing with distance.
pub fn confidence(distance: f32) -> f32 {
    (1.0 - distance / MAX_UNIT_DISTANCE).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        let v = normalize(&[3.0, 4.0]).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert!(normalize(&[0.0, 0.0]).is_none());
        assert!(normalize(&[f32::NAN, 1.0]).is_none());
    }

    #[test]
    fn test_distances_agree_on_unit_vectors() {
        let a = normalize(&[1.0, 2.0, 3.0]).unwrap();
        let b = normalize(&[3.0, 2.0, 1.0]).unwrap();
        // For unit vectors |a-b|^2 = 2 * cosine distance
        let e = euclidean_distance(&a, &b);
        let c = cosine_distance(&a, &b);
        assert!((e * e - 2.0 * c).abs() < 1e-5);

        assert!(cosine_distance(&a, &a).abs() < 1e-6);
        let neg: Vec<f32> = a.iter().map(|x| -x).collect();
        assert!((cosine_distance(&a, &neg) - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_mismatched_dimensions_never_match() {
        assert_eq!(euclidean_distance(&[1.0], &[1.0, 0.0]), f32::MAX);
        assert_eq!(cosine_distance(&[1.0], &[1.0, 0.0]), f32::MAX);
    }

    #[test]
    fn test_confidence_is_monotonic_and_clipped() {
        assert_eq!(confidence(0.0), 1.0);
        assert!((confidence(0.1) - 0.95).abs() < 1e-6);
        assert!(confidence(0.2) < confidence(0.1));
        assert_eq!(confidence(5.0), 0.0);
        assert_eq!(confidence(f32::MAX), 0.0);
    }
}
