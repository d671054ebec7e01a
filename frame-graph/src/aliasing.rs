//! Greedy interval partitioning of transient resources onto physical buckets.
//!
//! Candidates are visited by `first_use`. A bucket becomes free once its current
//! occupant's `last_use` is strictly before the next candidate's `first_use`, and
//! free buckets are only handed to candidates with the same [`AliasSignature`].
//! Within one signature this uses exactly as many buckets as the peak number of
//! simultaneously live candidates.

use crate::resources::{ResourceDescriptor, ResourceHandle, ResourceLifetime};
use std::cmp::Ordering;
use std::collections::binary_heap::PeekMut;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use wgpu::TextureFormat;

/// Resources may share a bucket only when their signatures are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AliasSignature {
    Texture {
        format: TextureFormat,
        width: u32,
        height: u32,
        depth_or_array_layers: u32,
        mip_level_count: u32,
        sample_count: u32,
    },
    Buffer {
        size_class: u64,
    },
}

impl AliasSignature {
    pub fn of(descriptor: &ResourceDescriptor, buffer_granularity: u64) -> Self {
        match descriptor {
            ResourceDescriptor::Texture(texture) => AliasSignature::Texture {
                format: texture.format,
                width: texture.width,
                height: texture.height,
                depth_or_array_layers: texture.depth_or_array_layers,
                mip_level_count: texture.mip_level_count,
                sample_count: texture.sample_count,
            },
            ResourceDescriptor::Buffer(buffer) => {
                let granularity = buffer_granularity.max(1);
                AliasSignature::Buffer {
                    size_class: buffer.size.div_ceil(granularity) * granularity,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AliasCandidate {
    pub resource: ResourceHandle,
    pub signature: AliasSignature,
    pub lifetime: ResourceLifetime,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BucketId(u32);

impl BucketId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Default)]
pub struct BucketAssignment {
    signatures: Vec<AliasSignature>,
    occupants: Vec<Vec<ResourceHandle>>,
    bucket_of: HashMap<ResourceHandle, BucketId>,
}

impl BucketAssignment {
    pub fn bucket_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn bucket_of(&self, resource: ResourceHandle) -> Option<BucketId> {
        self.bucket_of.get(&resource).copied()
    }

    pub fn signature(&self, bucket: BucketId) -> &AliasSignature {
        &self.signatures[bucket.index()]
    }

    /// Occupants in the order they were placed, which is `first_use` order.
    pub fn occupants(&self, bucket: BucketId) -> &[ResourceHandle] {
        &self.occupants[bucket.index()]
    }

    pub fn buckets(&self) -> impl Iterator<Item = BucketId> + '_ {
        (0..self.signatures.len()).map(|index| BucketId(index as u32))
    }

    fn open_bucket(&mut self, signature: AliasSignature) -> BucketId {
        let bucket = BucketId(self.signatures.len() as u32);
        self.signatures.push(signature);
        self.occupants.push(Vec::new());
        bucket
    }

    fn occupy(&mut self, bucket: BucketId, resource: ResourceHandle) {
        self.occupants[bucket.index()].push(resource);
        self.bucket_of.insert(resource, bucket);
    }
}

struct LiveBucket {
    bucket: BucketId,
    last_use: usize,
}

impl PartialEq for LiveBucket {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LiveBucket {}

impl PartialOrd for LiveBucket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the earliest-ending bucket first.
impl Ord for LiveBucket {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .last_use
            .cmp(&self.last_use)
            .then_with(|| other.bucket.cmp(&self.bucket))
    }
}

pub fn assign_buckets(candidates: &[AliasCandidate]) -> BucketAssignment {
    let mut ordered: Vec<&AliasCandidate> = candidates.iter().collect();
    ordered.sort_by_key(|candidate| (candidate.lifetime.first_use, candidate.resource));

    let mut assignment = BucketAssignment::default();
    let mut live: BinaryHeap<LiveBucket> = BinaryHeap::new();
    let mut free: HashMap<AliasSignature, BTreeSet<BucketId>> = HashMap::new();

    for candidate in ordered {
        while let Some(entry) = live.peek_mut() {
            if entry.last_use >= candidate.lifetime.first_use {
                break;
            }
            let ended = PeekMut::pop(entry);
            free.entry(assignment.signature(ended.bucket).clone())
                .or_default()
                .insert(ended.bucket);
        }

        let reused = free
            .get_mut(&candidate.signature)
            .and_then(|buckets| buckets.pop_first());
        let bucket = match reused {
            Some(bucket) => bucket,
            None => assignment.open_bucket(candidate.signature.clone()),
        };

        assignment.occupy(bucket, candidate.resource);
        live.push(LiveBucket {
            bucket,
            last_use: candidate.lifetime.last_use,
        });
    }

    assignment
}

/// One bucket per candidate, in `first_use` order. Used when aliasing is disabled.
pub fn assign_dedicated(candidates: &[AliasCandidate]) -> BucketAssignment {
    let mut ordered: Vec<&AliasCandidate> = candidates.iter().collect();
    ordered.sort_by_key(|candidate| (candidate.lifetime.first_use, candidate.resource));

    let mut assignment = BucketAssignment::default();
    for candidate in ordered {
        let bucket = assignment.open_bucket(candidate.signature.clone());
        assignment.occupy(bucket, candidate.resource);
    }
    assignment
}

/// Peak number of lifetimes that contain the same position.
pub fn high_water_mark(lifetimes: impl IntoIterator<Item = ResourceLifetime>) -> usize {
    let mut events: Vec<(usize, i64)> = Vec::new();
    for lifetime in lifetimes {
        events.push((lifetime.first_use, 1));
        events.push((lifetime.last_use + 1, -1));
    }
    // Ends sort before starts at the same position.
    events.sort_unstable();

    let mut live = 0i64;
    let mut peak = 0i64;
    for (_, delta) in events {
        live += delta;
        peak = peak.max(live);
    }
    peak as usize
}
