// Per-region cell counts, volumes and densities.
//
// Point and voxel tallies are first collected per distinct region id, then
// each tally is added to the region and to every one of its ancestors, so a
// region's figures include everything beneath it. Ids are processed in the
// order they were first seen.

use log::{info, warn};
use std::collections::HashMap;

use crate::error::Result;
use crate::ontology::{Lineage, RegionId, RegionOntology};
use crate::points::Point;
use crate::volume::LabelTally;

// Voxel edge lengths in micrometres.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VoxelSize {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl VoxelSize {
    pub fn new(x: f64, y: f64, z: f64) -> VoxelSize {
        VoxelSize { x, y, z }
    }

    pub fn isotropic(edge: f64) -> VoxelSize {
        VoxelSize::new(edge, edge, edge)
    }

    // µm³ to mm³
    pub fn voxel_volume_mm3(&self) -> f64 {
        self.x * self.y * self.z / 1e9
    }
}

impl Default for VoxelSize {
    fn default() -> Self {
        VoxelSize::isotropic(25.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegionStats {
    pub id: RegionId,
    pub count: u64,
    // mm³
    pub volume: f64,
    // cells per mm³, 0 for zero-volume regions
    pub density: f64,
}

// Points and voxels that did not land in any region.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Bucket {
    pub count: u64,
    pub volume: f64,
}

#[derive(Clone, Debug)]
pub struct RegionSummary {
    // One entry per ontology region, in ontology order.
    pub stats: Vec<RegionStats>,
    // Labelled with the universe id.
    pub background: Bucket,
    // Missing a label, or labelled with an id the ontology does not know.
    pub unassigned: Bucket,
}

impl RegionSummary {
    pub fn get(&self, ontology: &RegionOntology, id: RegionId) -> Option<&RegionStats> {
        ontology.index_of(id).map(|i| &self.stats[i])
    }
}

#[derive(Default)]
struct Tally {
    order: Vec<RegionId>,
    counts: HashMap<RegionId, u64>,
}

impl Tally {
    fn add(&mut self, id: RegionId, n: u64) {
        if !self.counts.contains_key(&id) {
            self.order.push(id);
        }
        *self.counts.entry(id).or_insert(0) += n;
    }

    fn iter(&self) -> impl Iterator<Item = (RegionId, u64)> + '_ {
        self.order.iter().map(|id| (*id, self.counts[id]))
    }
}

pub struct RegionAggregator<'a> {
    ontology: &'a RegionOntology,
    voxel_size: VoxelSize,
    points: Tally,
    voxels: Tally,
    unlabeled_points: u64,
}

impl<'a> RegionAggregator<'a> {
    pub fn new(ontology: &'a RegionOntology, voxel_size: VoxelSize) -> RegionAggregator<'a> {
        RegionAggregator {
            ontology,
            voxel_size,
            points: Tally::default(),
            voxels: Tally::default(),
            unlabeled_points: 0,
        }
    }

    pub fn add_points(&mut self, points: &[Point]) {
        for point in points {
            match point.region_id {
                Some(id) => self.points.add(id, 1),
                None => self.unlabeled_points += 1,
            }
        }
    }

    pub fn add_label_tally(&mut self, tally: &LabelTally) {
        for &(label, n) in tally.entries() {
            self.voxels.add(label as RegionId, n);
        }
    }

    // Roll everything up the hierarchy. Fails only if a parent chain is
    // broken, which a validated ontology rules out.
    pub fn finish(self) -> Result<RegionSummary> {
        let ontology = self.ontology;
        let voxel_volume = self.voxel_size.voxel_volume_mm3();

        let mut counts = vec![0u64; ontology.len()];
        let mut voxels = vec![0u64; ontology.len()];
        let mut background = Bucket::default();
        let mut unassigned = Bucket {
            count: self.unlabeled_points,
            volume: 0.0,
        };
        let mut unassigned_voxels = 0u64;
        let mut lineages: HashMap<RegionId, Lineage> = HashMap::new();

        for (id, n) in self.points.iter() {
            let lineage = lineage_of(ontology, &mut lineages, id)?;
            match lineage {
                Lineage::Background => background.count += n,
                Lineage::Unknown => {
                    warn!("{} cells labelled with unknown region id {}", n, id);
                    unassigned.count += n;
                }
                Lineage::Path(path) => path.iter().for_each(|&i| counts[i] += n),
            }
        }

        for (id, n) in self.voxels.iter() {
            let lineage = lineage_of(ontology, &mut lineages, id)?;
            match lineage {
                Lineage::Background => background.volume += n as f64 * voxel_volume,
                Lineage::Unknown => {
                    warn!("{} voxels labelled with unknown region id {}", n, id);
                    unassigned_voxels += n;
                }
                Lineage::Path(path) => path.iter().for_each(|&i| voxels[i] += n),
            }
        }
        unassigned.volume = unassigned_voxels as f64 * voxel_volume;

        let stats = ontology
            .nodes()
            .iter()
            .zip(counts.iter().zip(voxels.iter()))
            .map(|(node, (&count, &nvoxels))| {
                let volume = nvoxels as f64 * voxel_volume;
                RegionStats {
                    id: node.id,
                    count,
                    volume,
                    density: if volume > 0.0 {
                        count as f64 / volume
                    } else {
                        0.0
                    },
                }
            })
            .collect();

        info!(
            "Aggregated {} cells into {} regions ({} background, {} unassigned)",
            self.points.counts.values().sum::<u64>() + self.unlabeled_points,
            ontology.len(),
            background.count,
            unassigned.count
        );

        Ok(RegionSummary {
            stats,
            background,
            unassigned,
        })
    }
}

fn lineage_of<'l>(
    ontology: &RegionOntology,
    cache: &'l mut HashMap<RegionId, Lineage>,
    id: RegionId,
) -> Result<&'l Lineage> {
    if !cache.contains_key(&id) {
        let lineage = ontology.lineage(id)?;
        cache.insert(id, lineage);
    }
    Ok(&cache[&id])
}

// Counts and volumes for a point table and label tally in one call.
pub fn aggregate_regions(
    ontology: &RegionOntology,
    voxel_size: VoxelSize,
    points: &[Point],
    tally: &LabelTally,
) -> Result<RegionSummary> {
    let mut aggregator = RegionAggregator::new(ontology, voxel_size);
    aggregator.add_points(points);
    aggregator.add_label_tally(tally);
    aggregator.finish()
}
