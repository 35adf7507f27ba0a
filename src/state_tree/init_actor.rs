// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The init actor's state: the canonical address→id map and the id
//! allocator. The state tree has to reach into this one concrete actor —
//! address resolution and actor creation cannot be expressed otherwise.

use anyhow::Context as _;
use multihash_codetable::Code;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::{Address, Payload};
use fvm_shared::{ActorID, HAMT_BIT_WIDTH};

use crate::ipld_hamt::{BytesKey, Hamt};

pub const INIT_ACTOR_ID: ActorID = 1;
pub const INIT_ACTOR_ADDR: Address = Address::new_id(INIT_ACTOR_ID);

/// First id handed out to a non-singleton actor.
const FIRST_NON_SINGLETON_ID: ActorID = 100;

#[derive(Debug, Clone, Serialize_tuple, Deserialize_tuple)]
pub struct InitActorState {
    pub address_map: Cid,
    pub next_id: ActorID,
    pub network_name: String,
}

impl InitActorState {
    /// Fresh state with an empty address map.
    pub fn new<BS: Blockstore>(store: &BS, network_name: String) -> anyhow::Result<Self> {
        let address_map = Hamt::<_, ActorID>::new_with_bit_width(store, HAMT_BIT_WIDTH)
            .flush()
            .context("flushing empty address map")?;
        Ok(InitActorState {
            address_map,
            next_id: FIRST_NON_SINGLETON_ID,
            network_name,
        })
    }

    /// Allocates an id for `addr` and records the mapping. The caller
    /// persists the updated state and commits it to the init actor.
    pub fn map_address_to_new_id<BS: Blockstore>(
        &mut self,
        store: &BS,
        addr: &Address,
    ) -> anyhow::Result<ActorID> {
        let id = self.next_id;
        self.next_id += 1;

        let mut map =
            Hamt::<_, ActorID>::load_with_bit_width(&self.address_map, store, HAMT_BIT_WIDTH)?;
        map.set(BytesKey(addr.to_bytes()), id)?;
        self.address_map = map.flush()?;
        Ok(id)
    }

    /// Resolves an address to an id address, if the mapping exists. Id
    /// addresses pass through unchanged.
    pub fn resolve_address<BS: Blockstore>(
        &self,
        store: &BS,
        addr: &Address,
    ) -> anyhow::Result<Option<ActorID>> {
        if let &Payload::ID(id) = addr.payload() {
            return Ok(Some(id));
        }
        let map =
            Hamt::<_, ActorID>::load_with_bit_width(&self.address_map, store, HAMT_BIT_WIDTH)?;
        Ok(map.get(&BytesKey(addr.to_bytes()))?.copied())
    }

    /// Persists this state and returns its new head CID.
    pub fn save<BS: Blockstore>(&self, store: &BS) -> anyhow::Result<Cid> {
        use fvm_ipld_encoding::CborStore;
        store.put_cbor(self, Code::Blake2b256)
    }
}
