// Removal of repeated detections of the same cell.
//
// Points must be sorted by decreasing intensity. Each point that has not
// already been removed removes every other point it overlaps, so the
// brightest member of a cluster is the one that survives. Two points overlap
// if all coordinate differences are below `min_distance`, or if the x and y
// differences are below `min_distance / 2` and the z difference is below
// `2 * min_distance`. The second test catches cells that show up on several
// adjacent optical sections.

use log::{debug, info};
use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;

use crate::error::{Error, Result};
use crate::points::Point;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OverlapRule {
    pub min_distance: f64,
    xy_slab: f64,
    z_slab: f64,
}

impl OverlapRule {
    pub fn new(min_distance: f64) -> OverlapRule {
        OverlapRule {
            min_distance,
            xy_slab: min_distance / 2.0,
            z_slab: min_distance * 2.0,
        }
    }

    // Non-finite coordinates produce inf/NaN differences, which compare
    // false, so such points never overlap anything.
    pub fn overlaps(&self, a: &Point, b: &Point) -> bool {
        let dx = (a.x - b.x).abs();
        let dy = (a.y - b.y).abs();
        let dz = (a.z - b.z).abs();

        let isotropic = dx < self.min_distance && dy < self.min_distance && dz < self.min_distance;
        let stacked = dx < self.xy_slab && dy < self.xy_slab && dz < self.z_slab;

        isotropic || stacked
    }

    // Extent of the union of both overlap boxes along each axis.
    fn reach(&self) -> (f64, f64, f64) {
        let xy = self.min_distance.max(self.xy_slab);
        let z = self.min_distance.max(self.z_slab);
        (xy, xy, z)
    }

    fn is_degenerate(&self) -> bool {
        !(self.min_distance > 0.0) || !self.min_distance.is_finite()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanStrategy {
    // Compare every pair. Quadratic; kept as the reference behavior.
    Exhaustive,
    // Query a k-d tree for candidates within reach of each point.
    KdTree,
}

pub struct PointDeduplicator {
    rule: OverlapRule,
    strategy: ScanStrategy,
}

impl PointDeduplicator {
    pub fn new(min_distance: f64) -> PointDeduplicator {
        PointDeduplicator {
            rule: OverlapRule::new(min_distance),
            strategy: ScanStrategy::KdTree,
        }
    }

    pub fn with_strategy(mut self, strategy: ScanStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn rule(&self) -> &OverlapRule {
        &self.rule
    }

    // Flags for each input point, true where the point is removed.
    pub fn removed_mask(&self, points: &[Point]) -> Result<Vec<bool>> {
        check_sorted(points)?;
        if self.rule.is_degenerate() {
            return Ok(vec![false; points.len()]);
        }

        let removed = match self.strategy {
            ScanStrategy::Exhaustive => scan_exhaustive(points, &self.rule),
            ScanStrategy::KdTree => scan_kdtree(points, &self.rule),
        };
        Ok(removed)
    }

    pub fn run(&self, points: &[Point]) -> Result<Vec<Point>> {
        let removed = self.removed_mask(points)?;
        let kept: Vec<Point> = points
            .iter()
            .zip(removed.iter())
            .filter(|(_, removed)| !**removed)
            .map(|(p, _)| *p)
            .collect();

        info!(
            "{} overlapping detections removed, {} kept",
            points.len() - kept.len(),
            kept.len()
        );
        Ok(kept)
    }
}

pub fn remove_overlap(points: &[Point], min_distance: f64) -> Result<Vec<Point>> {
    PointDeduplicator::new(min_distance).run(points)
}

// Intensities must be non-increasing, with any NaN intensities at the end.
fn check_sorted(points: &[Point]) -> Result<()> {
    for (i, w) in points.windows(2).enumerate() {
        let (a, b) = (w[0].intensity, w[1].intensity);
        let ok = if a.is_nan() { b.is_nan() } else { b.is_nan() || b <= a };
        if !ok {
            return Err(Error::Unsorted(i + 1));
        }
    }
    Ok(())
}

fn scan_exhaustive(points: &[Point], rule: &OverlapRule) -> Vec<bool> {
    let mut removed = vec![false; points.len()];
    for i in 0..points.len() {
        if removed[i] {
            debug!("Removed overlapping cell at index {}", i);
            continue;
        }

        for j in 0..points.len() {
            if j != i && rule.overlaps(&points[i], &points[j]) {
                removed[j] = true;
            }
        }
    }
    removed
}

type PointTree = ImmutableKdTree<f64, u32, 3, 32>;

fn scan_kdtree(points: &[Point], rule: &OverlapRule) -> Vec<bool> {
    let mut removed = vec![false; points.len()];

    // the tree only holds points with finite coordinates, which are the
    // only ones that can overlap anything
    let finite: Vec<usize> = (0..points.len())
        .filter(|&i| {
            let p = &points[i];
            p.x.is_finite() && p.y.is_finite() && p.z.is_finite()
        })
        .collect();
    if finite.is_empty() {
        return removed;
    }
    let coords: Vec<[f64; 3]> = finite
        .iter()
        .map(|&i| [points[i].x, points[i].y, points[i].z])
        .collect();
    let tree = PointTree::new_from_slice(&coords);

    // Anything that can overlap a point lies inside the union of both
    // overlap boxes, hence within the box's half-diagonal.
    let (rx, ry, rz) = rule.reach();
    let radius = rx * rx + ry * ry + rz * rz;

    for &i in &finite {
        if removed[i] {
            debug!("Removed overlapping cell at index {}", i);
            continue;
        }

        let p = &points[i];
        for neighbor in tree.within_unsorted::<SquaredEuclidean>(&[p.x, p.y, p.z], radius) {
            let j = finite[neighbor.item as usize];
            if j != i && rule.overlaps(p, &points[j]) {
                removed[j] = true;
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::sort_by_intensity_desc;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_points(rng: &mut StdRng, n: usize, extent: f64) -> Vec<Point> {
        let mut points: Vec<Point> = (0..n)
            .map(|_| {
                Point::new(
                    rng.random_range(0.0..extent),
                    rng.random_range(0.0..extent),
                    rng.random_range(0.0..extent).floor(),
                    rng.random_range(0.0..1000.0),
                )
            })
            .collect();
        sort_by_intensity_desc(&mut points);
        points
    }

    #[test]
    fn test_keeps_brightest() {
        let points = vec![
            Point::new(0.0, 0.0, 0.0, 100.0),
            Point::new(1.0, 0.0, 0.0, 90.0),
            Point::new(50.0, 50.0, 50.0, 80.0),
        ];
        let kept = remove_overlap(&points, 5.0).unwrap();
        assert_eq!(kept, vec![points[0], points[2]]);
    }

    #[test]
    fn test_stacked_detection_removed() {
        // too far apart in z for the isotropic test, close enough for the
        // stacked-section test
        let points = vec![
            Point::new(10.0, 10.0, 10.0, 100.0),
            Point::new(11.0, 11.0, 17.0, 50.0),
        ];
        let kept = remove_overlap(&points, 5.0).unwrap();
        assert_eq!(kept, vec![points[0]]);

        // the stacked test is tighter in xy
        let points = vec![
            Point::new(10.0, 10.0, 10.0, 100.0),
            Point::new(13.0, 10.0, 17.0, 50.0),
        ];
        let kept = remove_overlap(&points, 5.0).unwrap();
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_removed_points_do_not_remove() {
        // b is removed by a, so c (which only overlaps b) survives
        let points = vec![
            Point::new(0.0, 0.0, 0.0, 100.0),
            Point::new(4.0, 0.0, 0.0, 90.0),
            Point::new(8.0, 0.0, 0.0, 80.0),
        ];
        let kept = remove_overlap(&points, 5.0).unwrap();
        assert_eq!(kept, vec![points[0], points[2]]);
    }

    #[test]
    fn test_empty() {
        assert!(remove_overlap(&[], 5.0).unwrap().is_empty());
    }

    #[test]
    fn test_unsorted_input_rejected() {
        let points = vec![
            Point::new(0.0, 0.0, 0.0, 10.0),
            Point::new(1.0, 0.0, 0.0, 90.0),
        ];
        assert!(matches!(remove_overlap(&points, 5.0), Err(Error::Unsorted(1))));

        let points = vec![
            Point::new(0.0, 0.0, 0.0, f64::NAN),
            Point::new(1.0, 0.0, 0.0, 90.0),
        ];
        assert!(matches!(remove_overlap(&points, 5.0), Err(Error::Unsorted(1))));
    }

    #[test]
    fn test_non_finite_coordinates_never_match() {
        let points = vec![
            Point::new(f64::NAN, 0.0, 0.0, 100.0),
            Point::new(0.0, 0.0, 0.0, 90.0),
            Point::new(f64::INFINITY, 0.0, 0.0, 80.0),
            Point::new(f64::INFINITY, 0.0, 0.0, 70.0),
            Point::new(0.5, 0.0, 0.0, 60.0),
        ];
        for strategy in [ScanStrategy::Exhaustive, ScanStrategy::KdTree] {
            let mask = PointDeduplicator::new(5.0)
                .with_strategy(strategy)
                .removed_mask(&points)
                .unwrap();
            assert_eq!(mask, vec![false, false, false, false, true]);
        }
    }

    #[test]
    fn test_degenerate_distance_keeps_everything() {
        let points = vec![
            Point::new(0.0, 0.0, 0.0, 100.0),
            Point::new(0.0, 0.0, 0.0, 90.0),
        ];
        assert_eq!(remove_overlap(&points, 0.0).unwrap().len(), 2);
        assert_eq!(remove_overlap(&points, f64::NAN).unwrap().len(), 2);
    }

    #[test]
    fn test_kdtree_matches_exhaustive() {
        let mut rng = StdRng::seed_from_u64(42);
        for &min_distance in &[1.0, 3.0, 7.5] {
            let points = random_points(&mut rng, 400, 60.0);
            let exhaustive = PointDeduplicator::new(min_distance)
                .with_strategy(ScanStrategy::Exhaustive)
                .removed_mask(&points)
                .unwrap();
            let kdtree = PointDeduplicator::new(min_distance)
                .with_strategy(ScanStrategy::KdTree)
                .removed_mask(&points)
                .unwrap();
            assert_eq!(exhaustive, kdtree);
        }
    }

    #[test]
    fn test_many_points_on_one_slice() {
        // far more points than a tree bucket holds, all sharing z
        let mut points: Vec<Point> = (0..40)
            .flat_map(|i| {
                (0..40).map(move |j| {
                    Point::new(i as f64 * 3.0, j as f64 * 3.0, 12.0, (i * 40 + j) as f64)
                })
            })
            .collect();
        sort_by_intensity_desc(&mut points);

        let exhaustive = PointDeduplicator::new(5.0)
            .with_strategy(ScanStrategy::Exhaustive)
            .removed_mask(&points)
            .unwrap();
        let kdtree = PointDeduplicator::new(5.0).removed_mask(&points).unwrap();
        assert_eq!(exhaustive, kdtree);
        assert!(kdtree.iter().any(|&r| r));
    }

    #[test]
    fn test_idempotent() {
        let mut rng = StdRng::seed_from_u64(7);
        let points = random_points(&mut rng, 500, 50.0);
        let once = remove_overlap(&points, 4.0).unwrap();
        let twice = remove_overlap(&once, 4.0).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_no_isotropic_neighbors_survive() {
        let mut rng = StdRng::seed_from_u64(11);
        let points = random_points(&mut rng, 500, 40.0);
        let d = 4.0;
        let kept = remove_overlap(&points, d).unwrap();
        for (i, a) in kept.iter().enumerate() {
            for b in kept.iter().skip(i + 1) {
                let close = (a.x - b.x).abs() < d && (a.y - b.y).abs() < d && (a.z - b.z).abs() < d;
                assert!(!close);
            }
        }
    }

    #[test]
    fn test_sparse_input_unchanged() {
        let points: Vec<Point> = (0..10)
            .map(|i| Point::new(i as f64 * 20.0, 0.0, 0.0, 100.0 - i as f64))
            .collect();
        assert_eq!(remove_overlap(&points, 5.0).unwrap(), points);
    }

    #[test]
    fn test_order_dependence() {
        let a = Point::new(0.0, 0.0, 0.0, 10.0);
        let b = Point::new(1.0, 0.0, 0.0, 10.0);
        assert_eq!(remove_overlap(&[a, b], 5.0).unwrap(), vec![a]);
        assert_eq!(remove_overlap(&[b, a], 5.0).unwrap(), vec![b]);
    }
}
