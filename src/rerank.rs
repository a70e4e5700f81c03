//! Exact late-interaction scoring.
//!
//! For each query token, find the best-matching page token by inner product
//! and sum those maxima. Pages answer a query well when every query token
//! has some page token close to it, which is what makes multi-vector
//! retrieval stronger than single-vector cosine over pooled embeddings.

/// MaxSim score between a multi-vector query and one page's token vectors.
///
/// `score = sum over query tokens of max over page tokens of <q_i, d_j>`
///
/// A page with no token vectors scores 0.0, as does an empty query.
pub fn maxsim(query: &[Vec<f32>], page: &[Vec<f32>]) -> f32 {
    if page.is_empty() {
        return 0.0;
    }
    query
        .iter()
        .map(|q| {
            page.iter()
                .map(|d| dot(q, d))
                .fold(f32::NEG_INFINITY, f32::max)
        })
        .sum()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum()
}
