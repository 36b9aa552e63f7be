//! Bio merge map.
//!
//! Each bio queue keeps the data bios it has accepted but not yet submitted
//! in pending groups: runs of sector-contiguous bios with the same action
//! and direction, owned by the request whose work item will submit them.
//! The [`BioMap`] indexes every group by its first sector (head) and its last
//! sector (tail) so a new bio can find the group it extends:
//!
//! ```text
//!   group A: [100..=107][108..=115]         map: 100 → A, 115 → A
//!   new bio  [116..=123]  back sector 115 → A  ⇒ append, map: 100 → A, 123 → A
//!   new bio  [ 92..=99 ]  front sector 100 → A ⇒ prepend, map:  92 → A, 123 → A
//! ```
//!
//! All of this runs under the owning queue's lock; nothing here blocks or
//! touches the device.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tracing::trace;

use crate::bio::{Bio, IoDirection, RequestId, Sector};
use crate::error::{Error, Result};
use crate::work_queue::BioQAction;

// =============================================================================
// Bio Map
// =============================================================================

/// The map has no room for another key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bio map full ({capacity} entries)")]
pub struct BioMapFull {
    pub capacity: usize,
}

/// The bio's request already owns a pending group the bio cannot join.
/// The refused bio is handed back untouched.
#[derive(Debug, Error)]
#[error("{id} already has a pending bio group")]
pub struct GroupPending {
    pub id: RequestId,
    pub bio: Bio,
}

/// Fixed-capacity sector → request index.
#[derive(Debug)]
pub struct BioMap {
    entries: HashMap<Sector, RequestId>,
    capacity: usize,
}

impl BioMap {
    /// Allocate a map able to hold `capacity` keys.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut entries = HashMap::new();
        entries
            .try_reserve(capacity)
            .map_err(|e| Error::AllocationFailed {
                what: "bio map",
                reason: e.to_string(),
            })?;
        Ok(Self { entries, capacity })
    }

    pub fn get(&self, sector: Sector) -> Option<RequestId> {
        self.entries.get(&sector).copied()
    }

    /// Insert or replace. A new key is refused once the map is at capacity.
    pub fn put(
        &mut self,
        sector: Sector,
        id: RequestId,
    ) -> std::result::Result<Option<RequestId>, BioMapFull> {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&sector) {
            return Err(BioMapFull {
                capacity: self.capacity,
            });
        }
        Ok(self.entries.insert(sector, id))
    }

    pub fn remove(&mut self, sector: Sector) -> Option<RequestId> {
        self.entries.remove(&sector)
    }

    /// Remove the entry at `sector` only if it belongs to `id`.
    pub fn remove_if(&mut self, sector: Sector, id: RequestId) -> bool {
        if self.entries.get(&sector) == Some(&id) {
            self.entries.remove(&sector);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All entries, ordered by sector.
    pub fn entries(&self) -> Vec<(Sector, RequestId)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(s, id)| (*s, *id)).collect();
        entries.sort_unstable();
        entries
    }
}

// =============================================================================
// Pending Groups
// =============================================================================

/// Contiguous, not yet submitted bios owned by one request's work item.
#[derive(Debug)]
struct PendingGroup {
    action: BioQAction,
    direction: IoDirection,
    bios: VecDeque<Bio>,
}

impl PendingGroup {
    /// First and last sector covered.
    fn span(&self) -> Option<(Sector, Sector)> {
        Some((self.bios.front()?.sector(), self.bios.back()?.last_sector()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeKind {
    Back,
    Front,
}

/// What [`BioMapState::try_merge`] did with a bio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Started a new group; the caller must schedule its work item.
    /// `indexed` is false when the map was full and the group cannot attract
    /// merges.
    Queued { indexed: bool },
    /// Appended to the tail of another request's group.
    BackMerged(RequestId),
    /// Prepended to the head of another request's group.
    FrontMerged(RequestId),
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        !matches!(self, MergeOutcome::Queued { .. })
    }
}

/// Merge map plus the groups it indexes. Guarded by the bio queue's lock.
#[derive(Debug)]
pub struct BioMapState {
    map: BioMap,
    groups: HashMap<RequestId, PendingGroup>,
}

impl BioMapState {
    pub fn new(map_capacity: usize) -> Result<Self> {
        Ok(Self {
            map: BioMap::with_capacity(map_capacity)?,
            groups: HashMap::new(),
        })
    }

    /// Fold `bio` into an adjacent pending group if one is compatible,
    /// otherwise start a new group for its request.
    ///
    /// When the bio fills the gap between two groups it joins the following
    /// group, leaving both work items in place.
    ///
    /// A request owns at most one pending group. A bio that would start a
    /// second one is refused with [`GroupPending`].
    pub fn try_merge(
        &mut self,
        action: BioQAction,
        bio: Bio,
    ) -> std::result::Result<MergeOutcome, GroupPending> {
        if bio.sectors() == 0 {
            return self.queue_new(action, bio);
        }

        let prev = bio
            .sector()
            .checked_sub(1)
            .and_then(|back| self.mergeable(action, &bio, back, MergeKind::Back));
        let next = bio
            .last_sector()
            .checked_add(1)
            .and_then(|front| self.mergeable(action, &bio, front, MergeKind::Front))
            .filter(|next| Some(*next) != prev);

        match (prev, next) {
            (None, None) => self.queue_new(action, bio),
            (Some(prev), None) => self.back_merge(prev, action, bio),
            (_, Some(next)) => self.front_merge(next, action, bio),
        }
    }

    fn mergeable(
        &self,
        action: BioQAction,
        bio: &Bio,
        merge_sector: Sector,
        kind: MergeKind,
    ) -> Option<RequestId> {
        let candidate = self.map.get(merge_sector)?;
        let group = self.groups.get(&candidate)?;
        if group.action != action || group.direction != bio.direction() {
            return None;
        }
        let (head, tail) = group.span()?;
        let boundary = match kind {
            MergeKind::Back => tail,
            MergeKind::Front => head,
        };
        (boundary == merge_sector).then_some(candidate)
    }

    fn queue_new(
        &mut self,
        action: BioQAction,
        bio: Bio,
    ) -> std::result::Result<MergeOutcome, GroupPending> {
        let id = bio.owner().id();
        if self.groups.contains_key(&id) {
            return Err(GroupPending { id, bio });
        }
        let (head, tail) = (bio.sector(), bio.last_sector());
        self.groups.insert(
            id,
            PendingGroup {
                action,
                direction: bio.direction(),
                bios: VecDeque::from([bio]),
            },
        );
        let indexed = self.index(id, head, tail);
        trace!(request = %id, head, tail, indexed, "queued new bio group");
        Ok(MergeOutcome::Queued { indexed })
    }

    fn back_merge(
        &mut self,
        into: RequestId,
        action: BioQAction,
        bio: Bio,
    ) -> std::result::Result<MergeOutcome, GroupPending> {
        let Some(group) = self.groups.get_mut(&into) else {
            return self.queue_new(action, bio);
        };
        if let Some((_, old_tail)) = group.span() {
            self.map.remove_if(old_tail, into);
        }
        group.bios.push_back(bio);
        let span = group.span();
        if let Some((head, tail)) = span {
            self.index(into, head, tail);
            trace!(request = %into, head, tail, "back merge");
        }
        Ok(MergeOutcome::BackMerged(into))
    }

    fn front_merge(
        &mut self,
        into: RequestId,
        action: BioQAction,
        bio: Bio,
    ) -> std::result::Result<MergeOutcome, GroupPending> {
        let Some(group) = self.groups.get_mut(&into) else {
            return self.queue_new(action, bio);
        };
        if let Some((old_head, _)) = group.span() {
            self.map.remove_if(old_head, into);
        }
        group.bios.push_front(bio);
        let span = group.span();
        if let Some((head, tail)) = span {
            self.index(into, head, tail);
            trace!(request = %into, head, tail, "front merge");
        }
        Ok(MergeOutcome::FrontMerged(into))
    }

    /// Point head and tail at `id`. Returns false if the map refused a key.
    fn index(&mut self, id: RequestId, head: Sector, tail: Sector) -> bool {
        let head_ok = self.map.put(head, id).is_ok();
        let tail_ok = head == tail || self.map.put(tail, id).is_ok();
        head_ok && tail_ok
    }

    /// Detach every bio of `id`'s group and drop its map entries. Returns the
    /// bios in ascending sector order; empty if `id` has no group.
    pub fn take_group(&mut self, id: RequestId) -> Vec<Bio> {
        let Some(group) = self.groups.remove(&id) else {
            return Vec::new();
        };
        if let Some((head, tail)) = group.span() {
            self.map.remove_if(head, id);
            self.map.remove_if(tail, id);
        }
        Vec::from(group.bios)
    }

    /// Request whose group is indexed at `sector`.
    pub fn lookup(&self, sector: Sector) -> Option<RequestId> {
        self.map.get(sector)
    }

    /// First and last sector of `id`'s group.
    pub fn group_span(&self, id: RequestId) -> Option<(Sector, Sector)> {
        self.groups.get(&id)?.span()
    }

    /// Requests owning the bios of `id`'s group, in sector order.
    pub fn group_members(&self, id: RequestId) -> Vec<RequestId> {
        self.groups
            .get(&id)
            .map(|g| g.bios.iter().map(|b| b.owner().id()).collect())
            .unwrap_or_default()
    }

    pub fn map_entries(&self) -> Vec<(Sector, RequestId)> {
        self.map.entries()
    }

    pub fn map_len(&self) -> usize {
        self.map.len()
    }

    pub fn map_capacity(&self) -> usize {
        self.map.capacity()
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn pending_bios(&self) -> usize {
        self.groups.values().map(|g| g.bios.len()).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::request::tests::noop_request;
    use crate::bio::{BioOp, VioType, SECTOR_SIZE};
    use bytes::BytesMut;

    fn bio(sector: Sector, sectors: usize, op: BioOp) -> Bio {
        Bio::new(
            noop_request(sector / 8, VioType::Data),
            op,
            sector,
            BytesMut::zeroed(sectors * SECTOR_SIZE),
        )
    }

    fn write(sector: Sector) -> Bio {
        bio(sector, 8, BioOp::Write)
    }

    fn state() -> BioMapState {
        BioMapState::new(64).unwrap()
    }

    fn merge(state: &mut BioMapState, action: BioQAction, bio: Bio) -> MergeOutcome {
        state.try_merge(action, bio).unwrap()
    }

    #[test]
    fn test_bio_map_capacity() {
        let mut map = BioMap::with_capacity(2).unwrap();
        let a = noop_request(0, VioType::Data).id();
        let b = noop_request(0, VioType::Data).id();

        assert_eq!(map.put(1, a), Ok(None));
        assert_eq!(map.put(2, a), Ok(None));
        assert_eq!(map.put(3, a), Err(BioMapFull { capacity: 2 }));
        // Replacing an existing key is always allowed.
        assert_eq!(map.put(2, b), Ok(Some(a)));

        assert!(!map.remove_if(2, a));
        assert!(map.remove_if(2, b));
        assert_eq!(map.remove(1), Some(a));
        assert!(map.is_empty());
    }

    #[test]
    fn test_bio_map_allocation_failure() {
        let result = BioMap::with_capacity(usize::MAX);
        assert!(matches!(
            result,
            Err(Error::AllocationFailed { what: "bio map", .. })
        ));
    }

    #[test]
    fn test_lone_bio_indexed_at_head_and_tail() {
        let mut state = state();
        let b = write(100);
        let id = b.owner().id();

        assert_eq!(
            merge(&mut state, BioQAction::Data, b),
            MergeOutcome::Queued { indexed: true }
        );
        assert_eq!(state.map_entries(), vec![(100, id), (107, id)]);
        assert_eq!(state.group_span(id), Some((100, 107)));
    }

    #[test]
    fn test_single_sector_group_uses_one_entry() {
        let mut state = state();
        let b = bio(50, 1, BioOp::Write);
        let id = b.owner().id();
        merge(&mut state, BioQAction::Data, b);
        assert_eq!(state.map_entries(), vec![(50, id)]);
    }

    #[test]
    fn test_back_merge() {
        let mut state = state();
        let first = write(100);
        let first_id = first.owner().id();
        let second = write(108);
        let second_id = second.owner().id();

        merge(&mut state, BioQAction::Data, first);
        assert_eq!(
            merge(&mut state, BioQAction::Data, second),
            MergeOutcome::BackMerged(first_id)
        );

        assert_eq!(state.map_entries(), vec![(100, first_id), (115, first_id)]);
        assert_eq!(state.group_span(first_id), Some((100, 115)));
        assert_eq!(state.group_members(first_id), vec![first_id, second_id]);
        assert_eq!(state.pending_groups(), 1);
    }

    #[test]
    fn test_front_merge_prepends() {
        let mut state = state();
        let later = write(108);
        let later_id = later.owner().id();
        let earlier = write(100);
        let earlier_id = earlier.owner().id();

        merge(&mut state, BioQAction::Data, later);
        assert_eq!(
            merge(&mut state, BioQAction::Data, earlier),
            MergeOutcome::FrontMerged(later_id)
        );

        assert_eq!(state.map_entries(), vec![(100, later_id), (115, later_id)]);
        assert_eq!(state.group_members(later_id), vec![earlier_id, later_id]);
    }

    #[test]
    fn test_gap_fill_joins_following_group() {
        let mut state = state();
        let low = write(100);
        let low_id = low.owner().id();
        let high = write(116);
        let high_id = high.owner().id();
        let middle = write(108);
        let middle_id = middle.owner().id();

        merge(&mut state, BioQAction::Data, low);
        merge(&mut state, BioQAction::Data, high);
        assert_eq!(
            merge(&mut state, BioQAction::Data, middle),
            MergeOutcome::FrontMerged(high_id)
        );

        assert_eq!(state.group_span(low_id), Some((100, 107)));
        assert_eq!(state.group_span(high_id), Some((108, 123)));
        assert_eq!(state.group_members(high_id), vec![middle_id, high_id]);
        assert_eq!(
            state.map_entries(),
            vec![(100, low_id), (107, low_id), (108, high_id), (123, high_id)]
        );
    }

    #[test]
    fn test_no_merge_across_actions() {
        let mut state = state();
        let a = write(100);
        let a_id = a.owner().id();
        let b = write(108);
        let b_id = b.owner().id();

        merge(&mut state, BioQAction::Data, a);
        assert_eq!(
            merge(&mut state, BioQAction::CompressedData, b),
            MergeOutcome::Queued { indexed: true }
        );
        assert_eq!(state.pending_groups(), 2);
        assert_eq!(state.lookup(100), Some(a_id));
        assert_eq!(state.lookup(107), Some(a_id));
        assert_eq!(state.lookup(108), Some(b_id));
        assert_eq!(state.lookup(115), Some(b_id));
    }

    #[test]
    fn test_no_merge_across_directions() {
        let mut state = state();
        merge(&mut state, BioQAction::Data, write(100));
        let outcome = merge(&mut state, BioQAction::Data, bio(108, 8, BioOp::Read));
        assert!(!outcome.is_merged());
        assert_eq!(state.pending_groups(), 2);
        assert_eq!(state.map_len(), 4);
    }

    #[test]
    fn test_non_adjacent_does_not_merge() {
        let mut state = state();
        merge(&mut state, BioQAction::Data, write(100));
        assert!(!merge(&mut state, BioQAction::Data, write(116)).is_merged());
        assert!(!merge(&mut state, BioQAction::Data, write(84)).is_merged());
    }

    #[test]
    fn test_take_group_returns_every_bio_once() {
        let mut state = state();
        let head = write(108);
        let head_id = head.owner().id();
        merge(&mut state, BioQAction::Data, head);
        merge(&mut state, BioQAction::Data, write(116));
        merge(&mut state, BioQAction::Data, write(100));
        merge(&mut state, BioQAction::Data, write(124));

        let bios = state.take_group(head_id);
        let sectors: Vec<Sector> = bios.iter().map(Bio::sector).collect();
        assert_eq!(sectors, vec![100, 108, 116, 124]);
        assert!(state.map_entries().is_empty());
        assert_eq!(state.pending_groups(), 0);
        assert!(state.take_group(head_id).is_empty());
    }

    #[test]
    fn test_full_map_degrades_to_unmerged() {
        let mut state = BioMapState::new(2).unwrap();
        merge(&mut state, BioQAction::Data, write(100));
        let b = write(200);
        let b_id = b.owner().id();

        assert_eq!(
            merge(&mut state, BioQAction::Data, b),
            MergeOutcome::Queued { indexed: false }
        );
        // The bio is still pending and will be submitted by its own work item.
        assert_eq!(state.pending_bios(), 2);
        assert_eq!(state.take_group(b_id).len(), 1);
    }

    #[test]
    fn test_stale_entry_is_not_removed_by_other_group() {
        let mut state = state();
        let a = write(100);
        let a_id = a.owner().id();
        merge(&mut state, BioQAction::Data, a);

        // An overlapping write to the same block takes over both keys.
        let b = write(100);
        let b_id = b.owner().id();
        merge(&mut state, BioQAction::Data, b);
        assert_eq!(state.lookup(100), Some(b_id));

        assert_eq!(state.take_group(a_id).len(), 1);
        assert_eq!(state.map_entries(), vec![(100, b_id), (107, b_id)]);
    }

    #[test]
    fn test_second_group_for_same_request_is_refused() {
        let mut state = state();
        let owner = noop_request(1, VioType::Data);
        let first = Bio::new(owner.clone(), BioOp::Write, 8, BytesMut::zeroed(8 * SECTOR_SIZE));
        let far = Bio::new(owner.clone(), BioOp::Write, 800, BytesMut::zeroed(8 * SECTOR_SIZE));
        merge(&mut state, BioQAction::Data, first);

        let refused = state.try_merge(BioQAction::Data, far).unwrap_err();
        assert_eq!(refused.id, owner.id());
        assert_eq!(refused.bio.sector(), 800);
        assert_eq!(state.pending_bios(), 1);
        assert_eq!(state.map_entries(), vec![(8, owner.id()), (15, owner.id())]);

        // Extending its own group is still a merge.
        let next = Bio::new(owner.clone(), BioOp::Write, 16, BytesMut::zeroed(8 * SECTOR_SIZE));
        assert_eq!(
            merge(&mut state, BioQAction::Data, next),
            MergeOutcome::BackMerged(owner.id())
        );
        assert_eq!(state.take_group(owner.id()).len(), 2);

        // Once the group is taken the request may start a new one.
        let again = Bio::new(owner.clone(), BioOp::Write, 800, BytesMut::zeroed(8 * SECTOR_SIZE));
        assert!(state.try_merge(BioQAction::Data, again).is_ok());
    }
}
