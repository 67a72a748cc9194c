//! Chooses the nodes an iteration acts on.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::cluster::{ClusterNode, MembershipSnapshot, NodeRef};
use crate::error::ConfigError;

/// Constraints on one selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionOptions {
    pub count: usize,
    pub allow_spares: bool,
    /// Draw whole mirror pairs; when false never pick both partners of a pair
    pub allow_mirrors: bool,
    /// Return the previous selection unchanged when there is one
    pub reuse: bool,
    /// Force the current master into the set
    pub always_include_master: bool,
}

/// Random node selection honoring spare, mirror, reuse and master constraints.
///
/// Selections are resolved against the snapshot passed to each call, so a
/// reused selection always carries fresh membership records.
pub struct NodeSelector {
    rng: StdRng,
    previous: Vec<NodeRef>,
}

impl NodeSelector {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            previous: Vec::new(),
        }
    }

    /// The last selection made, if any.
    pub fn previous(&self) -> &[NodeRef] {
        &self.previous
    }

    /// Forget the previous selection.
    pub fn reset(&mut self) {
        self.previous.clear();
    }

    pub fn select(
        &mut self,
        snapshot: &MembershipSnapshot,
        opts: &SelectionOptions,
    ) -> Result<Vec<ClusterNode>, ConfigError> {
        // the master can move between iterations, so a pinned set goes stale
        let reuse = opts.reuse && !opts.always_include_master;
        if opts.reuse && opts.always_include_master {
            debug!("following the master; ignoring node reuse");
        }
        if reuse && !self.previous.is_empty() {
            let nodes: Vec<ClusterNode> = self
                .previous
                .iter()
                .filter_map(|r| snapshot.node(r.ordinal).cloned())
                .collect();
            if nodes.len() == self.previous.len() {
                return Ok(nodes);
            }
        }

        let eligible: Vec<&ClusterNode> = snapshot
            .nodes
            .iter()
            .filter(|n| opts.allow_spares || !n.spare)
            .collect();
        let eligible_set: BTreeSet<u32> = eligible.iter().map(|n| n.ordinal).collect();

        let forced = if opts.always_include_master {
            let master = snapshot.master().ok_or(ConfigError::NoMaster)?;
            info!(master = %master.hostname, "including current master in the acting set");
            Some(master.ordinal)
        } else {
            None
        };

        let mut chosen = if opts.allow_mirrors {
            self.draw_pairs(&eligible, &eligible_set, opts.count, forced)?
        } else {
            self.draw_unmirrored(&eligible, &eligible_set, opts.count, forced)?
        };
        if let Some(master) = forced {
            if !chosen.contains(&master) {
                // the master is not eligible under the spare constraint
                chosen.truncate(opts.count.saturating_sub(1));
                chosen.push(master);
            }
        }

        chosen.sort_unstable();
        let nodes: Vec<ClusterNode> = chosen
            .iter()
            .filter_map(|o| snapshot.node(*o).cloned())
            .collect();
        self.previous = nodes.iter().map(ClusterNode::node_ref).collect();
        Ok(nodes)
    }

    fn draw_unmirrored(
        &mut self,
        eligible: &[&ClusterNode],
        eligible_set: &BTreeSet<u32>,
        count: usize,
        forced: Option<u32>,
    ) -> Result<Vec<u32>, ConfigError> {
        // one node per eligible pair plus every unpaired node
        let capacity = eligible
            .iter()
            .filter(|n| match n.mirror {
                Some(m) if eligible_set.contains(&m) => n.ordinal < m,
                _ => true,
            })
            .count();
        if count > capacity {
            return Err(ConfigError::NotEnoughNodes {
                requested: count,
                eligible: capacity,
            });
        }

        let mut pool: Vec<u32> = eligible.iter().map(|n| n.ordinal).collect();
        pool.shuffle(&mut self.rng);
        move_to_front(&mut pool, forced);
        let mirror_of = |o: u32| eligible.iter().find(|n| n.ordinal == o).and_then(|n| n.mirror);
        let mut chosen = Vec::with_capacity(count);
        for ordinal in pool {
            if chosen.len() == count {
                break;
            }
            if mirror_of(ordinal).is_some_and(|m| chosen.contains(&m)) {
                continue;
            }
            chosen.push(ordinal);
        }
        Ok(chosen)
    }

    /// Whole pairs first, then single nodes for an odd remainder. A forced
    /// node brings its partner along when the count leaves room for a pair.
    fn draw_pairs(
        &mut self,
        eligible: &[&ClusterNode],
        eligible_set: &BTreeSet<u32>,
        count: usize,
        forced: Option<u32>,
    ) -> Result<Vec<u32>, ConfigError> {
        if count > eligible.len() {
            return Err(ConfigError::NotEnoughNodes {
                requested: count,
                eligible: eligible.len(),
            });
        }

        let mut pairs: Vec<(u32, u32)> = eligible
            .iter()
            .filter_map(|n| match n.mirror {
                Some(m) if eligible_set.contains(&m) && n.ordinal < m => Some((n.ordinal, m)),
                _ => None,
            })
            .collect();
        pairs.shuffle(&mut self.rng);
        if let Some(f) = forced {
            if let Some(pos) = pairs.iter().position(|(a, b)| *a == f || *b == f) {
                let pair = pairs.remove(pos);
                pairs.insert(0, pair);
            }
        }

        let mut chosen: Vec<u32> = Vec::with_capacity(count);
        for (a, b) in pairs {
            if count - chosen.len() < 2 {
                break;
            }
            chosen.push(a);
            chosen.push(b);
        }

        // top up with single nodes
        let mut rest: Vec<u32> = eligible
            .iter()
            .map(|n| n.ordinal)
            .filter(|o| !chosen.contains(o))
            .collect();
        rest.shuffle(&mut self.rng);
        move_to_front(&mut rest, forced);
        chosen.extend(rest.into_iter().take(count - chosen.len()));

        if let Some(f) = forced.filter(|f| eligible_set.contains(f) && !chosen.contains(f)) {
            // no room for the forced node's pair and no single slot left
            debug!(node = f, "forced node has no eligible partner; replacing half a pair");
            chosen.pop();
            chosen.push(f);
        }
        Ok(chosen)
    }
}

fn move_to_front(pool: &mut Vec<u32>, node: Option<u32>) {
    if let Some(pos) = node.and_then(|n| pool.iter().position(|o| *o == n)) {
        let n = pool.remove(pos);
        pool.insert(0, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MembershipRecord;

    /// 16 nodes, last two spares, pairs (i, i + 7) over the 14 active nodes,
    /// node 3 is master.
    fn cluster() -> MembershipSnapshot {
        let nodes = (1..=16)
            .map(|ordinal| {
                let spare = ordinal > 14;
                let mirror = match ordinal {
                    1..=7 => Some(ordinal + 7),
                    8..=14 => Some(ordinal - 7),
                    _ => None,
                };
                ClusterNode {
                    ordinal,
                    hostname: format!("node{ordinal:02}"),
                    pingable: true,
                    spare,
                    mirror,
                    membership: Some(MembershipRecord {
                        is_master: ordinal == 3,
                        ..MembershipRecord::healthy()
                    }),
                }
            })
            .collect();
        MembershipSnapshot::new(nodes)
    }

    fn opts(count: usize) -> SelectionOptions {
        SelectionOptions {
            count,
            allow_spares: false,
            allow_mirrors: false,
            reuse: false,
            always_include_master: false,
        }
    }

    fn ordinals(nodes: &[ClusterNode]) -> Vec<u32> {
        nodes.iter().map(|n| n.ordinal).collect()
    }

    #[test]
    fn never_selects_spares_unless_allowed() {
        let snap = cluster();
        for seed in 0..50 {
            let mut sel = NodeSelector::new(seed);
            let nodes = sel.select(&snap, &opts(7)).unwrap();
            assert_eq!(nodes.len(), 7);
            assert!(nodes.iter().all(|n| !n.spare));
        }
    }

    #[test]
    fn never_selects_both_mirrors_when_disallowed() {
        let snap = cluster();
        for seed in 0..50 {
            let mut sel = NodeSelector::new(seed);
            let picked = ordinals(&sel.select(&snap, &opts(7)).unwrap());
            for o in &picked {
                let partner = snap.node(*o).unwrap().mirror.unwrap();
                assert!(!picked.contains(&partner), "seed {seed}: {picked:?}");
            }
        }
    }

    #[test]
    fn mirrors_are_drawn_as_pairs() {
        let snap = cluster();
        let mut sel = NodeSelector::new(9);
        let o = SelectionOptions {
            allow_mirrors: true,
            ..opts(4)
        };
        let picked = ordinals(&sel.select(&snap, &o).unwrap());
        assert_eq!(picked.len(), 4);
        for p in &picked {
            let partner = snap.node(*p).unwrap().mirror.unwrap();
            assert!(picked.contains(&partner));
        }
    }

    #[test]
    fn too_many_nodes_is_a_configuration_error() {
        let snap = cluster();
        let mut sel = NodeSelector::new(1);
        let err = sel.select(&snap, &opts(8)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NotEnoughNodes {
                requested: 8,
                eligible: 7
            }
        ));

        let with_spares = SelectionOptions {
            allow_spares: true,
            allow_mirrors: true,
            ..opts(17)
        };
        assert!(sel.select(&snap, &with_spares).is_err());
    }

    #[test]
    fn always_includes_the_master() {
        let snap = cluster();
        for seed in 0..50 {
            let mut sel = NodeSelector::new(seed);
            let o = SelectionOptions {
                always_include_master: true,
                ..opts(3)
            };
            let picked = ordinals(&sel.select(&snap, &o).unwrap());
            assert_eq!(picked.len(), 3);
            assert!(picked.contains(&3));
            assert!(!picked.contains(&10), "master's mirror selected: {picked:?}");
        }
    }

    #[test]
    fn following_the_master_keeps_mirror_pairs_whole() {
        let snap = cluster();
        for count in 1..=5 {
            for seed in 0..50 {
                let mut sel = NodeSelector::new(seed);
                let o = SelectionOptions {
                    allow_mirrors: true,
                    always_include_master: true,
                    ..opts(count)
                };
                let picked = ordinals(&sel.select(&snap, &o).unwrap());
                assert_eq!(picked.len(), count);
                assert!(picked.contains(&3), "seed {seed}: {picked:?}");
                if count >= 2 {
                    assert!(picked.contains(&10), "master's partner missing: {picked:?}");
                }
                let unpaired = picked
                    .iter()
                    .filter(|p| !picked.contains(&snap.node(**p).unwrap().mirror.unwrap()))
                    .count();
                assert_eq!(unpaired, count % 2, "seed {seed}: {picked:?}");
            }
        }
    }

    #[test]
    fn reuse_returns_the_same_nodes() {
        let snap = cluster();
        let mut sel = NodeSelector::new(5);
        let o = SelectionOptions {
            reuse: true,
            ..opts(2)
        };
        let first = ordinals(&sel.select(&snap, &o).unwrap());
        for _ in 0..5 {
            assert_eq!(ordinals(&sel.select(&snap, &o).unwrap()), first);
        }
    }

    #[test]
    fn following_the_master_disables_reuse() {
        let mut snap = cluster();
        let mut sel = NodeSelector::new(5);
        let o = SelectionOptions {
            reuse: true,
            always_include_master: true,
            ..opts(2)
        };
        assert!(ordinals(&sel.select(&snap, &o).unwrap()).contains(&3));

        // master fails over to node 5
        for n in &mut snap.nodes {
            if let Some(m) = n.membership.as_mut() {
                m.is_master = n.ordinal == 5;
            }
        }
        assert!(ordinals(&sel.select(&snap, &o).unwrap()).contains(&5));
    }
}
