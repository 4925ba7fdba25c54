use crate::error::{CoreError, CoreResult, Upstream};

/// Cosine distance `1 - cos(a, b)`. `None` when the vectors are empty,
/// differ in length or either has zero norm.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    let cos = (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0);
    Some(1.0 - cos)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub distance: f64,
}

/// Nearest-neighbor search: ascending cosine distance, ties by insertion order.
pub trait VectorIndex {
    fn dimensions(&self) -> Option<usize>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn insert(&mut self, id: String, vector: Vec<f32>) -> CoreResult<()>;
    fn search(&self, query: &[f32], k: usize) -> CoreResult<Vec<Neighbor>>;
}

/// Brute-force index. Adequate for one persona's corpus.
#[derive(Debug, Default, Clone)]
pub struct FlatIndex {
    entries: Vec<(String, Vec<f32>)>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorIndex for FlatIndex {
    fn dimensions(&self) -> Option<usize> {
        self.entries.first().map(|(_, v)| v.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, id: String, vector: Vec<f32>) -> CoreResult<()> {
        if let Some(dim) = self.dimensions()
            && dim != vector.len()
        {
            return Err(CoreError::upstream(
                Upstream::Index,
                format!("vector for '{id}' has {} dimensions, index has {dim}", vector.len()),
            ));
        }
        self.entries.push((id, vector));
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> CoreResult<Vec<Neighbor>> {
        if let Some(dim) = self.dimensions()
            && dim != query.len()
        {
            return Err(CoreError::upstream(
                Upstream::Index,
                format!("query has {} dimensions, index has {dim}", query.len()),
            ));
        }
        let mut hits: Vec<Neighbor> = self
            .entries
            .iter()
            .filter_map(|(id, v)| {
                cosine_distance(query, v).map(|distance| Neighbor {
                    id: id.clone(),
                    distance,
                })
            })
            .collect();
        // stable: equal distances keep insertion order
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cosine_distance_basics() {
        assert_relative_eq!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).unwrap(), 0.0);
        assert_relative_eq!(cosine_distance(&[1.0, 0.0], &[0.0, 1.0]).unwrap(), 1.0);
        assert_relative_eq!(cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]).unwrap(), 2.0);
        assert!(cosine_distance(&[1.0], &[1.0, 0.0]).is_none());
        assert!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]).is_none());
        assert!(cosine_distance(&[], &[]).is_none());
    }

    #[test]
    fn test_search_orders_ascending_with_stable_ties() {
        let mut index = FlatIndex::new();
        index.insert("far".into(), vec![0.0, 1.0]).unwrap();
        index.insert("tie1".into(), vec![1.0, 1.0]).unwrap();
        index.insert("near".into(), vec![1.0, 0.0]).unwrap();
        index.insert("tie2".into(), vec![2.0, 2.0]).unwrap();
        let hits = index.search(&[1.0, 0.0], 10).unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "tie1", "tie2", "far"]);
    }

    #[test]
    fn test_search_truncates() {
        let mut index = FlatIndex::new();
        for i in 0..5 {
            index.insert(format!("v{i}"), vec![1.0, i as f32]).unwrap();
        }
        assert_eq!(index.search(&[1.0, 0.0], 2).unwrap().len(), 2);
    }

    #[test]
    fn test_dimension_mismatch_is_upstream_error() {
        let mut index = FlatIndex::new();
        index.insert("a".into(), vec![1.0, 0.0]).unwrap();
        assert!(index.insert("b".into(), vec![1.0]).is_err());
        assert!(matches!(
            index.search(&[1.0, 0.0, 0.0], 1),
            Err(CoreError::Upstream { service: Upstream::Index, .. })
        ));
    }
}
