use std::cmp::Ordering;

use crate::colpali::MultiVector;

/// Averages token vectors into a single L2-normalized vector for recall.
pub fn mean_pool(vectors: &MultiVector) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return vec![];
    };

    let dim = first.len();
    let mut pooled = vec![0.0f32; dim];
    let mut counted = 0usize;

    for vector in vectors.iter().filter(|v| v.len() == dim) {
        for (acc, value) in pooled.iter_mut().zip(vector) {
            *acc += value;
        }
        counted += 1;
    }

    if counted == 0 {
        return vec![];
    }

    for value in pooled.iter_mut() {
        *value /= counted as f32;
    }

    let norm = pooled.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in pooled.iter_mut() {
            *value /= norm;
        }
    }

    pooled
}

/// Late-interaction score: for every query vector, the best dot product
/// against any page vector, summed.
pub fn max_sim(query: &MultiVector, page: &MultiVector) -> f32 {
    if page.is_empty() {
        return 0.0;
    }

    query
        .iter()
        .map(|q| {
            page.iter()
                .map(|p| dot(q, p))
                .fold(f32::NEG_INFINITY, f32::max)
        })
        .filter(|best| best.is_finite())
        .sum()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Scores candidates and returns `(candidate index, score)` pairs, best
/// first. The sort is stable so equal scores keep recall order.
pub fn rank_by_max_sim(query: &MultiVector, pages: &[&MultiVector], k: usize) -> Vec<(usize, f32)> {
    let mut scored: Vec<(usize, f32)> = pages
        .iter()
        .enumerate()
        .map(|(idx, page)| (idx, max_sim(query, page)))
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(k);
    scored
}
