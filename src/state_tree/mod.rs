// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Actor state tree: a HAMT from actor ids to actor records, with a
//! nested transactional overlay.
//!
//! The overlay is a stack of delta layers. Every `send` pushes a layer
//! and pops it on return, so reverting a failed call is O(1): the layer
//! is dropped instead of the tree being copied. Reads walk the stack top
//! to bottom; removals dominate; later writes mask earlier ones. The
//! bottom layer doubles as the warm cache of clean reads.

mod init_actor;

pub use init_actor::{InitActorState, INIT_ACTOR_ADDR, INIT_ACTOR_ID};

use ahash::{HashMap, HashSet};
use anyhow::{bail, ensure, Context as _};
use multihash_codetable::Code;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::CborStore;
use fvm_shared::address::{Address, Payload};
use fvm_shared::econ::TokenAmount;
use fvm_shared::state::{StateInfo0, StateRoot};
use fvm_shared::{ActorID, HAMT_BIT_WIDTH};

pub use fvm_shared::state::StateTreeVersion;

use crate::ipld_hamt::{BytesKey, Hamt};

/// On-chain actor record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ActorState {
    /// Identifies the actor's code.
    pub code: Cid,
    /// CID of the actor's current state object.
    pub state: Cid,
    /// Call sequence number (nonce); only meaningful for account actors.
    pub sequence: u64,
    pub balance: TokenAmount,
}

impl ActorState {
    pub fn new(code: Cid, state: Cid, balance: TokenAmount, sequence: u64) -> Self {
        ActorState {
            code,
            state,
            sequence,
            balance,
        }
    }

    /// Subtracts from the balance, failing on overdraft.
    pub fn deduct_funds(&mut self, amt: &TokenAmount) -> anyhow::Result<()> {
        ensure!(&self.balance >= amt, "not enough funds");
        self.balance -= amt.clone();
        Ok(())
    }

    pub fn deposit_funds(&mut self, amt: &TokenAmount) {
        self.balance += amt.clone();
    }
}

/// Canonical HAMT key of an actor id: 8 bytes, big-endian.
fn actor_key(id: ActorID) -> BytesKey {
    BytesKey(id.to_be_bytes().to_vec())
}

#[derive(Default)]
struct TxLayer {
    actors: HashMap<ActorID, ActorState>,
    removed: HashSet<ActorID>,
    lookup: HashMap<Address, ActorID>,
}

/// State tree over a block store. Not thread-safe: one message
/// application owns its tree.
pub struct StateTree<S> {
    hamt: Hamt<S, ActorState>,
    version: StateTreeVersion,
    info: Option<Cid>,
    /// Transaction stack; the bottom layer always exists.
    tx: Vec<TxLayer>,
}

impl<S> StateTree<S>
where
    S: Blockstore,
{
    pub fn new(store: S, version: StateTreeVersion) -> Self {
        StateTree {
            hamt: Hamt::new_with_bit_width(store, HAMT_BIT_WIDTH),
            version,
            info: None,
            tx: vec![TxLayer::default()],
        }
    }

    /// Loads a tree from a root CID: either a versioned `StateRoot`
    /// triple or, failing that, a bare version-0 HAMT root.
    pub fn new_from_root(store: S, root: &Cid) -> anyhow::Result<Self> {
        let versioned = store.get_cbor::<StateRoot>(root).unwrap_or(None);
        match versioned {
            Some(StateRoot {
                version,
                actors,
                info,
            }) => Ok(StateTree {
                hamt: Hamt::load_with_bit_width(&actors, store, HAMT_BIT_WIDTH)?,
                version,
                info: Some(info),
                tx: vec![TxLayer::default()],
            }),
            None => Ok(StateTree {
                hamt: Hamt::load_with_bit_width(root, store, HAMT_BIT_WIDTH)
                    .context("state root is neither a StateRoot nor a hamt root")?,
                version: StateTreeVersion::V0,
                info: None,
                tx: vec![TxLayer::default()],
            }),
        }
    }

    pub fn store(&self) -> &S {
        self.hamt.store()
    }

    pub fn version(&self) -> StateTreeVersion {
        self.version
    }

    /// Upgrades the tree's root format; takes effect at the next flush.
    pub fn set_version(&mut self, version: StateTreeVersion) {
        self.version = version;
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.len() > 1
    }

    /// Pushes an empty delta layer. Transactions nest.
    pub fn begin_transaction(&mut self) {
        self.tx.push(TxLayer::default());
    }

    /// Discards everything the current transaction wrote.
    pub fn revert_transaction(&mut self) {
        let top = self.tx.last_mut().expect("stack never empty");
        *top = TxLayer::default();
    }

    /// Merges the current transaction into its parent: later writes win,
    /// removals dominate.
    pub fn end_transaction(&mut self) -> anyhow::Result<()> {
        if self.tx.len() < 2 {
            bail!("end_transaction called without an open transaction");
        }
        let top = self.tx.pop().expect("checked above");
        let parent = self.tx.last_mut().expect("stack never empty");
        for (id, actor) in top.actors {
            parent.actors.insert(id, actor);
            parent.removed.remove(&id);
        }
        for (addr, id) in top.lookup {
            parent.lookup.insert(addr, id);
        }
        for id in top.removed {
            parent.removed.insert(id);
        }
        Ok(())
    }

    /// Resolves an address to an id: id payloads directly, then the
    /// transaction lookup maps, then the init actor's address map.
    pub fn lookup_id(&mut self, addr: &Address) -> anyhow::Result<Option<ActorID>> {
        if let &Payload::ID(id) = addr.payload() {
            return Ok(Some(id));
        }
        for layer in self.tx.iter().rev() {
            if let Some(id) = layer.lookup.get(addr) {
                return Ok(Some(*id));
            }
        }
        let init = self
            .get_actor_by_id(INIT_ACTOR_ID)?
            .context("init actor is missing from the state tree")?;
        let init_state: InitActorState = self
            .store()
            .get_cbor(&init.state)?
            .context("init actor state is missing from the store")?;
        let id = init_state.resolve_address(self.store(), addr)?;
        if let Some(id) = id {
            // Clean resolutions survive commits and reverts.
            self.tx
                .first_mut()
                .expect("stack never empty")
                .lookup
                .insert(*addr, id);
        }
        Ok(id)
    }

    /// Looks an actor up by address; misses against the overlay fall
    /// through to the HAMT and warm the bottom layer.
    pub fn get_actor(&mut self, addr: &Address) -> anyhow::Result<Option<ActorState>> {
        let Some(id) = self.lookup_id(addr)? else {
            return Ok(None);
        };
        self.get_actor_by_id(id)
    }

    pub fn get_actor_by_id(&mut self, id: ActorID) -> anyhow::Result<Option<ActorState>> {
        for layer in self.tx.iter().rev() {
            if layer.removed.contains(&id) {
                return Ok(None);
            }
            if let Some(actor) = layer.actors.get(&id) {
                return Ok(Some(actor.clone()));
            }
        }
        let actor = self.hamt.get(&actor_key(id))?.cloned();
        if let Some(actor) = &actor {
            self.tx
                .first_mut()
                .expect("stack never empty")
                .actors
                .insert(id, actor.clone());
        }
        Ok(actor)
    }

    /// Writes an actor into the current transaction.
    pub fn set_actor(&mut self, addr: &Address, actor: ActorState) -> anyhow::Result<()> {
        let id = self
            .lookup_id(addr)?
            .with_context(|| format!("cannot set actor at unresolved address {addr}"))?;
        self.set_actor_by_id(id, actor);
        Ok(())
    }

    pub fn set_actor_by_id(&mut self, id: ActorID, actor: ActorState) {
        let top = self.tx.last_mut().expect("stack never empty");
        top.actors.insert(id, actor);
        top.removed.remove(&id);
    }

    /// Records a removal in the current transaction.
    pub fn delete_actor(&mut self, addr: &Address) -> anyhow::Result<()> {
        let id = self
            .lookup_id(addr)?
            .with_context(|| format!("cannot delete actor at unresolved address {addr}"))?;
        let top = self.tx.last_mut().expect("stack never empty");
        top.removed.insert(id);
        Ok(())
    }

    /// Allocates a fresh id for `addr` through the init actor and commits
    /// the updated init state. The new mapping belongs to the current
    /// transaction: reverting it reverts the allocation.
    pub fn register_new_address(&mut self, addr: &Address) -> anyhow::Result<ActorID> {
        let mut init = self
            .get_actor_by_id(INIT_ACTOR_ID)?
            .context("init actor is missing from the state tree")?;
        let mut state: InitActorState = self
            .store()
            .get_cbor(&init.state)?
            .context("init actor state is missing from the store")?;
        let id = state.map_address_to_new_id(self.store(), addr)?;
        init.state = state.save(self.store())?;
        self.set_actor_by_id(INIT_ACTOR_ID, init);
        self.tx
            .last_mut()
            .expect("stack never empty")
            .lookup
            .insert(*addr, id);
        Ok(id)
    }

    /// Applies the pending writes to the HAMT and returns the new root
    /// CID. Only legal with a single active layer; nested transactions
    /// must be closed or reverted first.
    pub fn flush(&mut self) -> anyhow::Result<Cid> {
        ensure!(
            !self.in_transaction(),
            "cannot flush while inside a transaction"
        );

        let layer = &self.tx[0];
        for (id, actor) in &layer.actors {
            self.hamt.set(actor_key(*id), actor.clone())?;
        }
        for id in &layer.removed {
            self.hamt.delete(&actor_key(*id))?;
        }

        let actors = self.hamt.flush()?;
        match self.version {
            StateTreeVersion::V0 => Ok(actors),
            version => {
                let info = match self.info {
                    Some(info) => info,
                    None => {
                        let info = self
                            .store()
                            .put_cbor(&StateInfo0::default(), Code::Blake2b256)?;
                        self.info = Some(info);
                        info
                    }
                };
                Ok(self.store().put_cbor(
                    &StateRoot {
                        version,
                        actors,
                        info,
                    },
                    Code::Blake2b256,
                )?)
            }
        }
    }

    /// Unordered traversal of the persisted actors; overlay layers are
    /// not reflected until flushed.
    pub fn for_each<F>(&self, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(ActorID, &ActorState) -> anyhow::Result<()>,
    {
        self.hamt.for_each(|k, v| {
            let id = u64::from_be_bytes(
                k.0.as_slice()
                    .try_into()
                    .context("actor key is not 8 bytes")?,
            );
            f(id, v)
        })?;
        Ok(())
    }
}
