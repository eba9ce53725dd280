//! Property tests for command buffer playback.
//!
//! Random batches of creates, sets, removes and destroys are applied both to a
//! world and to a plain `HashMap` model with the same merge rules. After every
//! playback the world must agree with the model and its storage invariants
//! must hold.

use std::collections::HashMap;

use proptest::prelude::*;
use strata_ecs::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Hp(u32);

#[derive(Debug, Clone, PartialEq)]
struct Score(i64);

#[derive(Debug, Clone, PartialEq)]
struct Tag;

#[derive(Debug, Clone)]
enum CmdOp {
    Create { hp: Option<u32>, score: Option<i64>, tag: bool },
    SetHp(usize, u32),
    SetScore(usize, i64),
    RemoveHp(usize),
    RemoveScore(usize),
    AddTag(usize),
    Destroy(usize),
    Playback,
}

fn cmd_op_strategy() -> impl Strategy<Value = CmdOp> {
    prop_oneof![
        3 => (any::<Option<u32>>(), any::<Option<i64>>(), any::<bool>())
            .prop_map(|(hp, score, tag)| CmdOp::Create { hp, score, tag }),
        2 => (0..64usize, any::<u32>()).prop_map(|(i, v)| CmdOp::SetHp(i, v)),
        2 => (0..64usize, any::<i64>()).prop_map(|(i, v)| CmdOp::SetScore(i, v)),
        1 => (0..64usize).prop_map(CmdOp::RemoveHp),
        1 => (0..64usize).prop_map(CmdOp::RemoveScore),
        1 => (0..64usize).prop_map(CmdOp::AddTag),
        2 => (0..64usize).prop_map(CmdOp::Destroy),
        1 => Just(CmdOp::Playback),
    ]
}

/// Expected state of one entity.
#[derive(Debug, Clone, Default, PartialEq)]
struct Row {
    hp: Option<u32>,
    score: Option<i64>,
    tag: bool,
}

#[derive(Debug, Clone)]
enum Edit {
    Hp(Option<u32>),
    Score(Option<i64>),
    Tag,
}

#[derive(Default)]
struct Batch {
    creates: Vec<(BufferedEntity, Row)>,
    edits: Vec<(Entity, Edit)>,
    destroys: Vec<Entity>,
}

struct Harness {
    world: World,
    buffer: CommandBuffer,
    /// Every entity ever created, alive or not.
    known: Vec<Entity>,
    model: HashMap<Entity, Row>,
    batch: Batch,
}

impl Harness {
    fn new(config: WorldConfig) -> Self {
        let world = World::with_config(config).unwrap();
        let buffer = CommandBuffer::new(&world);
        Self {
            world,
            buffer,
            known: Vec::new(),
            model: HashMap::new(),
            batch: Batch::default(),
        }
    }

    fn target(&self, i: usize) -> Option<Entity> {
        if self.known.is_empty() {
            None
        } else {
            Some(self.known[i % self.known.len()])
        }
    }

    fn apply(&mut self, op: &CmdOp) {
        match *op {
            CmdOp::Create { hp, score, tag } => {
                let mut builder = self.buffer.create();
                if let Some(hp) = hp {
                    builder = builder.set(Hp(hp));
                }
                if let Some(score) = score {
                    builder = builder.set(Score(score));
                }
                if tag {
                    builder = builder.set(Tag);
                }
                let handle = builder.entity();
                self.batch.creates.push((handle, Row { hp, score, tag }));
            }
            CmdOp::SetHp(i, v) => {
                if let Some(e) = self.target(i) {
                    self.buffer.set(e, Hp(v)).unwrap();
                    self.batch.edits.push((e, Edit::Hp(Some(v))));
                }
            }
            CmdOp::SetScore(i, v) => {
                if let Some(e) = self.target(i) {
                    self.buffer.set(e, Score(v)).unwrap();
                    self.batch.edits.push((e, Edit::Score(Some(v))));
                }
            }
            CmdOp::RemoveHp(i) => {
                if let Some(e) = self.target(i) {
                    self.buffer.remove::<Hp>(e).unwrap();
                    self.batch.edits.push((e, Edit::Hp(None)));
                }
            }
            CmdOp::RemoveScore(i) => {
                if let Some(e) = self.target(i) {
                    self.buffer.remove::<Score>(e).unwrap();
                    self.batch.edits.push((e, Edit::Score(None)));
                }
            }
            CmdOp::AddTag(i) => {
                if let Some(e) = self.target(i) {
                    self.buffer.set(e, Tag).unwrap();
                    self.batch.edits.push((e, Edit::Tag));
                }
            }
            CmdOp::Destroy(i) => {
                if let Some(e) = self.target(i) {
                    self.buffer.destroy(e).unwrap();
                    self.batch.destroys.push(e);
                }
            }
            CmdOp::Playback => self.playback(),
        }
    }

    /// Play the buffer back and mirror the same phases on the model.
    fn playback(&mut self) {
        let batch = std::mem::take(&mut self.batch);
        let resolver = self.buffer.playback(&mut self.world).unwrap();

        for (handle, row) in batch.creates {
            let entity = resolver.resolve(handle).unwrap();
            self.known.push(entity);
            self.model.insert(entity, row);
        }
        for e in &batch.destroys {
            self.model.remove(e);
        }
        for (e, edit) in batch.edits {
            if let Some(row) = self.model.get_mut(&e) {
                match edit {
                    Edit::Hp(v) => row.hp = v,
                    Edit::Score(v) => row.score = v,
                    Edit::Tag => row.tag = true,
                }
            }
        }
    }

    fn check(&self) -> Result<(), TestCaseError> {
        let world = &self.world;
        prop_assert_eq!(world.entity_count(), self.model.len());

        for &e in &self.known {
            match self.model.get(&e) {
                Some(row) => {
                    prop_assert!(world.is_alive(e));
                    prop_assert_eq!(world.version(e.index()), e.version());
                    prop_assert_eq!(world.get::<Hp>(e).ok().map(|h| h.0), row.hp);
                    prop_assert_eq!(world.get::<Score>(e).ok().map(|s| s.0), row.score);
                    prop_assert_eq!(world.has::<Tag>(e), row.tag);
                    let expected = usize::from(row.hp.is_some()) + usize::from(row.score.is_some()) + usize::from(row.tag);
                    prop_assert_eq!(world.component_ids(e).unwrap().len(), expected);
                }
                None => {
                    prop_assert!(!world.is_alive(e));
                    prop_assert_ne!(world.version(e.index()), e.version());
                }
            }
        }

        let mut total = 0;
        for archetype in world.archetypes() {
            let mut rows = 0;
            for chunk in archetype.chunks() {
                prop_assert!(!chunk.is_empty());
                prop_assert!(chunk.len() <= chunk.capacity());
                prop_assert_eq!(chunk.entities().len(), chunk.len());
                for &id in chunk.entities() {
                    prop_assert!(id.is_valid());
                }
                rows += chunk.len();
            }
            prop_assert_eq!(archetype.entity_count(), rows);
            total += rows;
        }
        prop_assert_eq!(total, world.entity_count());
        Ok(())
    }
}

fn small_chunks() -> WorldConfig {
    WorldConfig {
        chunk_capacity: 3,
        chunk_hot_spares: 1,
        slot_segment_capacity: 8,
        max_aggregation_edges: 4,
        ..WorldConfig::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Random batches keep the world in step with the model.
    #[test]
    fn playback_matches_model(ops in prop::collection::vec(cmd_op_strategy(), 1..80)) {
        let mut harness = Harness::new(small_chunks());
        for op in &ops {
            harness.apply(op);
            if matches!(op, CmdOp::Playback) {
                harness.check()?;
            }
        }
        harness.playback();
        harness.check()?;
    }

    /// Defaults behave identically to tiny chunks and a tiny edge table.
    #[test]
    fn playback_matches_model_with_defaults(ops in prop::collection::vec(cmd_op_strategy(), 1..80)) {
        let mut harness = Harness::new(WorldConfig::default());
        for op in &ops {
            harness.apply(op);
        }
        harness.playback();
        harness.check()?;
    }

    /// Setting a value twice leaves exactly the second one.
    #[test]
    fn set_is_last_write_wins(first in any::<u32>(), second in any::<u32>()) {
        let mut harness = Harness::new(WorldConfig::default());
        harness.apply(&CmdOp::Create { hp: Some(0), score: None, tag: false });
        harness.playback();
        harness.apply(&CmdOp::SetHp(0, first));
        harness.apply(&CmdOp::SetHp(0, second));
        harness.playback();
        let e = harness.known[0];
        prop_assert_eq!(harness.world.get::<Hp>(e).unwrap(), &Hp(second));
        harness.check()?;
    }
}
