//! Vector math for the SQLite IVF index: cosine distance, spherical k-means and
//! probe selection.
//!
//! Centroids are unit vectors. Rows and queries are compared against them by cosine
//! distance, so stored embeddings never need to be normalized.

/// Cosine distance `1 - cos(a, b)` in `[0, 2]`.
///
/// A zero vector on either side has no direction, so its distance is defined as
/// `1.0` (no similarity). Mismatched lengths are treated the same way.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 1.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let cos = dot / (norm_a.sqrt() * norm_b.sqrt());
    1.0 - cos.clamp(-1.0, 1.0)
}

/// Scales `v` to unit length; zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Index of the centroid nearest to `v`.
pub fn nearest(v: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let distance = cosine_distance(v, centroid);
        if distance < best_distance {
            best = i;
            best_distance = distance;
        }
    }
    best
}

/// Indices of the `probes` centroids nearest to `query`, nearest first.
pub fn nearest_lists(query: &[f32], centroids: &[Vec<f32>], probes: usize) -> Vec<usize> {
    let mut ranked: Vec<(usize, f32)> = centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, cosine_distance(query, c)))
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(probes).map(|(i, _)| i).collect()
}

/// Spherical k-means over `sample`.
///
/// Seeds are spread evenly through the sample (`i * n / k`), so the result only
/// depends on the sample order. A cluster that loses all its members keeps its
/// previous centroid. Returns at most `min(k, sample.len())` unit-length centroids.
pub fn kmeans(sample: &[Vec<f32>], k: usize, iterations: usize) -> Vec<Vec<f32>> {
    let n = sample.len();
    let k = k.min(n);
    if k == 0 {
        return Vec::new();
    }
    let dimension = sample[0].len();

    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| {
            let mut seed = sample[i * n / k].clone();
            normalize(&mut seed);
            seed
        })
        .collect();

    for round in 0..iterations {
        let mut sums = vec![vec![0.0f32; dimension]; k];
        let mut counts = vec![0usize; k];
        for v in sample {
            let cluster = nearest(v, &centroids);
            counts[cluster] += 1;
            let mut unit = v.clone();
            normalize(&mut unit);
            for (s, x) in sums[cluster].iter_mut().zip(&unit) {
                *s += x;
            }
        }

        let mut moved = false;
        for (i, sum) in sums.into_iter().enumerate() {
            if counts[i] == 0 {
                continue;
            }
            let mut next = sum;
            normalize(&mut next);
            if next != centroids[i] {
                moved = true;
                centroids[i] = next;
            }
        }
        if !moved {
            tracing::debug!("k-means converged after {} rounds", round + 1);
            break;
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_distance() {
        assert!(cosine_distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 3.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        let d = cosine_distance(&[0.6, 0.8], &[0.8, 0.6]);
        assert!((d - 0.04).abs() < 1e-4);
    }

    #[test]
    fn test_zero_vector_distance_is_one() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 1.0]), 1.0);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[0.0, 0.0]), 1.0);
        assert_eq!(cosine_distance(&[1.0], &[1.0, 2.0]), 1.0);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_kmeans_separates_clusters() {
        let mut sample: Vec<Vec<f32>> = (0..20).map(|i| vec![1.0, i as f32 * 0.001, 0.0]).collect();
        sample.extend((0..20).map(|i| vec![0.0, i as f32 * 0.001, 1.0]));

        let centroids = kmeans(&sample, 2, 10);
        assert_eq!(centroids.len(), 2);
        let a = nearest(&[1.0, 0.0, 0.0], &centroids);
        let b = nearest(&[0.0, 0.0, 1.0], &centroids);
        assert_ne!(a, b);
        for c in &centroids {
            let norm: f32 = c.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_kmeans_caps_k_and_is_deterministic() {
        let sample = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
        let first = kmeans(&sample, 10, 5);
        let second = kmeans(&sample, 10, 5);
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert!(kmeans(&[], 4, 5).is_empty());
    }

    #[test]
    fn test_nearest_lists_orders_by_distance() {
        let centroids = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]];
        assert_eq!(nearest_lists(&[1.0, 0.1], &centroids, 2), vec![0, 2]);
        assert_eq!(nearest_lists(&[1.0, 0.1], &centroids, 10).len(), 3);
    }
}
