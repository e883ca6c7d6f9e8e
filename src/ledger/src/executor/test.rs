#![cfg(test)]
#![allow(missing_docs)]

use {
    super::{
        network::{AppRequest, AppResponse},
        *,
    },
    crate::{
        crypto::DigestVerifier,
        data_model::{
            ExportedOutput, GenesisValidator, Id, ImportInput, ValidatorEntry,
            PRIMARY_NETWORK_ID,
        },
        shared_memory::Memory,
        staking::test::{bls, test_cfg},
        store::db::{KVBatch, KValue, MemDB},
    },
    config::staking::{DAY, UNITS},
    parking_lot::Mutex,
    std::{sync::atomic::AtomicBool, thread},
};

const CHAIN: ChainId = Id([1; 32]);
const PEER: ChainId = Id([2; 32]);
const T0: Timestamp = 1_000_000;
const PAYER: Address = Address([8; 20]);
const FUNDS: Amount = 1_000_000 * UNITS;

struct Env {
    vm: Vm,
    clock: Arc<MockClock>,
    memory: Arc<Memory>,
    db: Arc<dyn KvStore>,
    cfg: Arc<StakingConfig>,
    genesis_node: NodeId,
}

fn genesis(node: NodeId) -> Genesis {
    Genesis {
        timestamp: T0,
        initial_supply: 360_000_000 * UNITS,
        validators: vec![GenesisValidator {
            node_id: node,
            weight: 2_000 * UNITS,
            end_time: T0 + 300 * DAY,
            reward_owner: Address([9; 20]),
            delegation_fee: 0,
            bls_key: Some(bls(9)),
        }],
        allocations: vec![(PAYER, FUNDS)],
    }
}

fn open(
    db: Arc<dyn KvStore>,
    cfg: Arc<StakingConfig>,
    memory: &Arc<Memory>,
    clock: &Arc<MockClock>,
    node: NodeId,
) -> Vm {
    Vm::new(
        db,
        cfg,
        &genesis(node),
        memory.new_shared_memory(CHAIN),
        Arc::new(DigestVerifier),
        clock.clone(),
    )
    .unwrap()
}

impl Env {
    fn new() -> Self {
        Self::with(test_cfg(), Arc::new(MemDB::new()))
    }

    fn with(cfg: StakingConfig, db: Arc<dyn KvStore>) -> Self {
        globutils::logging::init_logging(None);
        let cfg = Arc::new(cfg);
        let clock = Arc::new(MockClock::new(T0));
        let memory = Memory::new();
        let genesis_node = NodeId::random();
        let vm = open(db.clone(), cfg.clone(), &memory, &clock, genesis_node);
        Env {
            vm,
            clock,
            memory,
            db,
            cfg,
            genesis_node,
        }
    }

    /// A second node process over the same store.
    fn reopen(&self) -> Vm {
        open(
            self.db.clone(),
            self.cfg.clone(),
            &self.memory,
            &self.clock,
            self.genesis_node,
        )
    }

    /// Issue `unsigned` signed by the funded payer.
    fn issue(&self, unsigned: UnsignedTx) -> Result<TxId> {
        self.vm.issue_tx(signed(unsigned, &[PAYER]))
    }

    /// Build, verify and accept one standard block.
    fn step(&self) -> Block {
        let block = self.vm.build_block().unwrap();
        assert!(matches!(block.kind(), BlockKind::Standard { .. }));
        self.vm.verify(&block).unwrap();
        self.vm.accept(&block.id()).unwrap();
        block
    }

    /// Build the pending reward proposal and settle it with one option.
    fn decide(&self, commit: bool) -> Block {
        let proposal = self.vm.build_block().unwrap();
        self.decide_on(&proposal, commit)
    }

    fn decide_on(&self, proposal: &Block, commit: bool) -> Block {
        assert!(matches!(proposal.kind(), BlockKind::Proposal { .. }));
        self.vm.verify(proposal).unwrap();
        let [c, a] = self.vm.options(&proposal.id()).unwrap();
        assert_eq!(c.kind(), &BlockKind::Commit);
        assert_eq!(a.kind(), &BlockKind::Abort);
        self.vm.verify(&c).unwrap();
        self.vm.verify(&a).unwrap();

        self.vm.accept(&proposal.id()).unwrap();
        let (chosen, other) = if commit { (c, a) } else { (a, c) };
        self.vm.accept(&chosen.id()).unwrap();
        self.vm.reject(&other.id()).unwrap();
        self.vm.set_preference(&chosen.id()).unwrap();
        chosen
    }

    /// The peer chain exports `input` to us, spendable by the payer.
    fn publish(&self, input: &ImportInput) {
        let out = bincode::serialize(&ExportedOutput {
            amount: input.amount,
            owners: vec![PAYER],
            threshold: 1,
        })
        .unwrap();
        let puts = Requests {
            puts: vec![(import_key(input), out)],
            removes: vec![],
        };
        self.memory
            .new_shared_memory(PEER)
            .apply([(CHAIN, puts)].into_iter().collect())
            .unwrap();
    }

    /// The exported entry disappears from our inbound area.
    fn withdraw(&self, input: &ImportInput) {
        let removes = Requests {
            puts: vec![],
            removes: vec![import_key(input)],
        };
        self.memory
            .new_shared_memory(CHAIN)
            .apply([(PEER, removes)].into_iter().collect())
            .unwrap();
    }
}

fn add_validator(node: NodeId, weight: u64, start: u64, end: u64, key: Option<u8>) -> UnsignedTx {
    UnsignedTx::AddValidator {
        node_id: node,
        start_time: start,
        end_time: end,
        weight,
        reward_owner: Address(node.0),
        delegation_fee: 20_000,
        bls_key: key.map(bls),
        payer: PAYER,
        fee: 0,
    }
}

fn add_delegator(node: NodeId, weight: u64, start: u64, end: u64, owner: Address) -> UnsignedTx {
    UnsignedTx::AddDelegator {
        node_id: node,
        start_time: start,
        end_time: end,
        weight,
        reward_owner: owner,
        payer: PAYER,
        fee: 0,
    }
}

fn signed(unsigned: UnsignedTx, signers: &[Address]) -> Tx {
    let msg = bincode::serialize(&unsigned).unwrap();
    let creds = signers
        .iter()
        .map(|a| DigestVerifier::sign(*a, &msg))
        .collect();
    Tx::new(unsigned, creds).unwrap()
}

#[test]
fn issue_checks_admission() {
    let mut cfg = test_cfg();
    cfg.add_primary_network_validator_fee = 5;
    let e = Env::with(cfg, Arc::new(MemDB::new()));
    assert_eq!(e.vm.build_block(), Err(Error::NothingToBuild));

    e.clock.set(T0 + 1);
    let node = NodeId::random();
    let mut tx = add_validator(node, UNITS, T0 + 10, T0 + 100, None);
    assert_eq!(
        e.issue(tx.clone()),
        Err(Error::InsufficientFee {
            required: 5,
            provided: 0
        })
    );
    if let UnsignedTx::AddValidator { fee, .. } = &mut tx {
        *fee = 5;
    }
    let id = e.issue(tx.clone()).unwrap();
    assert!(matches!(e.issue(tx), Err(Error::Conflict(_))));
    assert!(matches!(
        e.issue(UnsignedTx::RewardValidator { staker_tx_id: id }),
        Err(Error::Malformed(_))
    ));

    // chain time is T0: a window has to open after it
    let mut late = add_validator(NodeId::random(), UNITS, T0, T0 + 100, None);
    if let UnsignedTx::AddValidator { fee, .. } = &mut late {
        *fee = 5;
    }
    assert!(matches!(e.issue(late), Err(Error::InvalidTiming(_))));
    assert_eq!(e.vm.mempool_len(), 1);
}

#[test]
fn over_delegation_is_refused() {
    let e = Env::new();
    e.clock.set(T0 + 1);
    let node = NodeId::random();
    let (start, end) = (T0 + 10, T0 + 10 + 20 * DAY);
    e.issue(add_validator(node, 1_000 * UNITS, start, end, None))
        .unwrap();
    e.step();
    let owner = Address([7; 20]);
    e.issue(add_delegator(node, 3_000 * UNITS, start + 1, start + 10 * DAY, owner))
        .unwrap();
    e.step();

    // starts the instant the first delegation ends; both count at that instant
    let err = e
        .issue(add_delegator(node, 1_000 * UNITS + 1, start + 10 * DAY, end, owner))
        .unwrap_err();
    assert_eq!(
        err,
        Error::OverDelegated {
            subnet: PRIMARY_NETWORK_ID,
            node
        }
    );
    assert_eq!(e.vm.mempool_len(), 0);

    e.issue(add_delegator(node, 1_000 * UNITS, start + 10 * DAY, end, owner))
        .unwrap();
    // fits next to the first delegation, not next to the one still queued
    let third = e
        .issue(add_delegator(node, 4_000 * UNITS, start + 10 * DAY + 1, end, owner))
        .unwrap();
    assert_eq!(e.vm.mempool_len(), 2);

    let block = e.step();
    assert_eq!(block.txs().len(), 1);
    assert_eq!(e.vm.mempool_len(), 0);
    assert!(e
        .vm
        .dropped_reason(&third)
        .unwrap()
        .contains("over-delegated"));
}

#[test]
fn rewards_are_decided_by_proposals() {
    let e = Env::new();
    e.clock.set(T0 + 1);
    let node = NodeId::random();
    let v_end = T0 + 10 + 30 * DAY;
    e.issue(add_validator(node, 2_000 * UNITS, T0 + 10, v_end, Some(1)))
        .unwrap();
    e.step();
    let owner = Address([7; 20]);
    let d_end = T0 + 20 + 10 * DAY;
    e.issue(add_delegator(node, 1_000 * UNITS, T0 + 20, d_end, owner))
        .unwrap();
    e.step();

    e.clock.set(T0 + 100 * DAY);
    e.step();
    assert_eq!(e.vm.timestamp(), T0 + 10);
    let v_reward = e
        .vm
        .current_validator(&PRIMARY_NETWORK_ID, &node)
        .unwrap()
        .potential_reward;
    assert!(v_reward > 0);

    let supply = e.vm.current_supply();
    e.step();
    assert_eq!(e.vm.timestamp(), T0 + 20);
    let d_reward = e.vm.current_supply() - supply;
    assert!(d_reward > 0);
    let active = e.vm.height();
    assert_eq!(
        e.vm.validator_set_at(active, &PRIMARY_NETWORK_ID).unwrap()[&node],
        ValidatorEntry {
            weight: 3_000 * UNITS,
            bls_key: Some(bls(1)),
        }
    );

    // the delegation window closes; its decision is now due
    e.step();
    assert_eq!(e.vm.timestamp(), d_end);

    let last = e.vm.last_accepted();
    let height = e.vm.height() + 1;
    let skipping = Block::new(last, height, d_end, BlockKind::Standard { txs: vec![] }).unwrap();
    assert!(matches!(e.vm.verify(&skipping), Err(Error::InvalidTiming(_))));
    let wrong = Tx::new(
        UnsignedTx::RewardValidator {
            staker_tx_id: Id::random(),
        },
        vec![],
    )
    .unwrap();
    let wrong = Block::new(last, height, d_end, BlockKind::Proposal { tx: wrong }).unwrap();
    assert!(matches!(e.vm.verify(&wrong), Err(Error::Malformed(_))));

    let commit = e.decide(true);
    assert_eq!(e.vm.last_accepted(), commit.id());
    let fee = d_reward * 20_000 / 1_000_000;
    // the delegated stake comes back with the reward
    assert_eq!(e.vm.balance(&owner), d_reward - fee + 1_000 * UNITS);

    e.step();
    assert_eq!(e.vm.timestamp(), v_end);
    let supply = e.vm.current_supply();
    e.decide(false);
    // the forfeited reward leaves the supply; delegation fees are paid anyway
    assert_eq!(e.vm.current_supply(), supply - v_reward);
    assert_eq!(e.vm.balance(&Address(node.0)), fee + 2_000 * UNITS);
    assert_eq!(e.vm.balance(&PAYER), FUNDS - 3_000 * UNITS);
    assert!(matches!(
        e.vm.current_validator(&PRIMARY_NETWORK_ID, &node),
        Err(Error::NotFound(_))
    ));
    assert_eq!(
        e.vm.validator_set_at(active, &PRIMARY_NETWORK_ID).unwrap()[&node].weight,
        3_000 * UNITS
    );
}

#[test]
fn import_waits_for_shared_memory() {
    let e = Env::new();
    let input = ImportInput {
        utxo_id: Id::random(),
        amount: 50 * UNITS,
        sig_indices: vec![0],
    };
    let to = Address([5; 20]);
    let import = UnsignedTx::Import {
        source_chain: PEER,
        inputs: vec![input.clone()],
        to,
        fee: 0,
    };

    assert!(e.issue(import.clone()).unwrap_err().is_recoverable());
    e.publish(&input);
    // only the owner of the utxo can spend it
    assert!(matches!(
        e.vm.issue_tx(Tx::new(import.clone(), vec![]).unwrap()),
        Err(Error::Malformed(_))
    ));
    assert!(matches!(
        e.vm.issue_tx(signed(import.clone(), &[Address([5; 20])])),
        Err(Error::Malformed(_))
    ));
    e.issue(import).unwrap();

    // gone again before the block is built: the tx stays queued
    e.withdraw(&input);
    e.clock.set(T0 + 1);
    assert_eq!(e.vm.build_block(), Err(Error::NothingToBuild));
    assert_eq!(e.vm.mempool_len(), 1);

    e.publish(&input);
    let block = e.vm.build_block().unwrap();
    e.withdraw(&input);
    let err = e.vm.verify(&block).unwrap_err();
    assert!(matches!(
        err,
        Error::NotFound(NotFound::SharedMemory { chain, .. }) if chain == PEER
    ));
    assert_eq!(e.vm.get_block(&block.id()).unwrap().1, Status::Processing);

    e.publish(&input);
    e.vm.verify(&block).unwrap();
    e.vm.accept(&block.id()).unwrap();
    assert_eq!(e.vm.balance(&to), 50 * UNITS);
    assert!(e
        .memory
        .new_shared_memory(CHAIN)
        .get(PEER, &[import_key(&input)])
        .is_err());

    // a utxo is imported once, even when published again
    e.publish(&input);
    let again = UnsignedTx::Import {
        source_chain: PEER,
        inputs: vec![input],
        to: Address([6; 20]),
        fee: 0,
    };
    assert!(matches!(e.issue(again), Err(Error::Conflict(_))));

    let vm = e.reopen();
    assert_eq!(vm.balance(&to), 50 * UNITS);
    assert_eq!(vm.height(), 1);
    assert_eq!(vm.timestamp(), T0 + 1);
    assert_eq!(vm.last_accepted(), block.id());
}

#[test]
fn restart_restores_stakers() {
    let e = Env::new();
    e.clock.set(T0 + 1);
    let node = NodeId::random();
    e.issue(add_validator(node, 1_000 * UNITS, T0 + 10, T0 + 10 + DAY, Some(2)))
        .unwrap();
    e.step();
    e.clock.set(T0 + 50);
    e.step();

    let vm = e.reopen();
    assert_eq!(vm.timestamp(), T0 + 10);
    assert_eq!(vm.height(), 2);
    assert_eq!(
        vm.current_validator(&PRIMARY_NETWORK_ID, &node).unwrap(),
        e.vm.current_validator(&PRIMARY_NETWORK_ID, &node).unwrap()
    );
    assert_eq!(vm.current_supply(), e.vm.current_supply());
    for h in 0..=2 {
        assert_eq!(
            vm.validator_set_at(h, &PRIMARY_NETWORK_ID).unwrap(),
            e.vm.validator_set_at(h, &PRIMARY_NETWORK_ID).unwrap()
        );
    }
    assert_eq!(vm.validator_set_at(1, &PRIMARY_NETWORK_ID).unwrap().len(), 1);
    assert_eq!(vm.validator_set_at(2, &PRIMARY_NETWORK_ID).unwrap().len(), 2);
}

#[test]
fn rejected_blocks_requeue_their_txs() {
    let e = Env::new();
    e.clock.set(T0 + 1);
    let node = NodeId::random();
    let id = e
        .issue(add_validator(node, 1_000 * UNITS, T0 + 10, T0 + 10 + DAY, None))
        .unwrap();
    let block = e.vm.build_block().unwrap();
    assert_eq!(e.vm.mempool_len(), 0);
    e.vm.verify(&block).unwrap();
    e.vm.set_preference(&block.id()).unwrap();

    e.vm.reject(&block.id()).unwrap();
    assert_eq!(e.vm.get_block(&block.id()).unwrap().1, Status::Rejected);
    assert_eq!(e.vm.preferred(), e.vm.last_accepted());
    assert_eq!(e.vm.mempool_len(), 1);
    assert!(matches!(e.vm.verify(&block), Err(Error::Conflict(_))));
    assert!(matches!(e.vm.accept(&block.id()), Err(Error::Conflict(_))));
    assert!(e.vm.pending_validator(&PRIMARY_NETWORK_ID, &node).is_err());

    // the same block would come out again
    assert_eq!(e.vm.build_block(), Err(Error::NothingToBuild));
    assert_eq!(e.vm.mempool_len(), 1);

    e.clock.set(T0 + 2);
    let rebuilt = e.step();
    assert_eq!(rebuilt.txs()[0].id(), id);
    assert!(e.vm.pending_validator(&PRIMARY_NETWORK_ID, &node).is_ok());
}

#[test]
fn children_of_unverified_blocks_wait() {
    let e = Env::new();
    e.clock.set(T0 + 1);
    e.issue(add_validator(NodeId::random(), UNITS, T0 + 10, T0 + 100, None))
        .unwrap();
    let parent = e.vm.build_block().unwrap();
    let create = signed(
        UnsignedTx::CreateSubnet {
            owners: vec![Address([3; 20])],
            threshold: 1,
            payer: PAYER,
            fee: 0,
        },
        &[PAYER],
    );
    let child = Block::new(
        parent.id(),
        2,
        T0 + 1,
        BlockKind::Standard { txs: vec![create] },
    )
    .unwrap();

    assert_eq!(
        e.vm.verify(&child),
        Err(Error::NotFound(NotFound::Block(parent.id())))
    );
    assert_eq!(e.vm.get_block(&child.id()).unwrap().1, Status::Processing);
    assert!(matches!(e.vm.accept(&child.id()), Err(Error::Malformed(_))));

    e.vm.verify(&parent).unwrap();
    e.vm.verify(&child).unwrap();
    e.vm.accept(&parent.id()).unwrap();
    e.vm.accept(&child.id()).unwrap();
    assert_eq!(e.vm.height(), 2);
    assert_eq!(e.vm.last_accepted(), child.id());
}

#[test]
fn only_the_tip_can_be_extended() {
    let e = Env::new();
    e.clock.set(T0 + 1);
    e.issue(add_validator(NodeId::random(), UNITS, T0 + 10, T0 + 100, None))
        .unwrap();
    let b1 = e.vm.build_block().unwrap();
    e.vm.verify(&b1).unwrap();
    e.issue(add_validator(NodeId::random(), UNITS, T0 + 10, T0 + 100, None))
        .unwrap();
    let b2 = e.vm.build_block().unwrap();
    assert_eq!(b1.parent_id(), b2.parent_id());
    e.vm.verify(&b2).unwrap();

    e.vm.accept(&b1.id()).unwrap();
    e.vm.accept(&b1.id()).unwrap();
    assert_eq!(e.vm.height(), 1);
    // the losing sibling is rejected on the spot
    assert_eq!(e.vm.get_block(&b2.id()).unwrap().1, Status::Rejected);
    assert_eq!(e.vm.mempool_len(), 1);
    assert!(e.vm.chain.read().blocks.is_empty());
    assert!(matches!(e.vm.accept(&b2.id()), Err(Error::Conflict(_))));

    e.vm.reject(&b2.id()).unwrap();
    assert_eq!(e.vm.mempool_len(), 1);
    assert!(matches!(e.vm.reject(&b1.id()), Err(Error::Conflict(_))));
    assert_eq!(e.vm.get_block(&b1.id()).unwrap().1, Status::Accepted);
}

#[test]
fn standard_block_time_is_bounded() {
    let e = Env::new();
    e.clock.set(T0 + 1);
    e.issue(add_validator(NodeId::random(), UNITS, T0 + 10, T0 + 100, None))
        .unwrap();
    e.step();

    let at = |ts| {
        Block::new(
            e.vm.last_accepted(),
            2,
            ts,
            BlockKind::Standard { txs: vec![] },
        )
        .unwrap()
    };
    // before the parent
    assert!(matches!(e.vm.verify(&at(T0)), Err(Error::InvalidTiming(_))));
    // beyond the sync bound
    assert!(matches!(e.vm.verify(&at(T0 + 12)), Err(Error::InvalidTiming(_))));

    e.clock.set(T0 + 100);
    // jumps over the pending start
    assert!(matches!(e.vm.verify(&at(T0 + 11)), Err(Error::InvalidTiming(_))));
    // changes nothing
    assert!(matches!(e.vm.verify(&at(T0 + 5)), Err(Error::Malformed(_))));
    e.vm.verify(&at(T0 + 10)).unwrap();
}

#[test]
fn subnet_validators_follow_their_primary() {
    let e = Env::new();
    e.clock.set(T0 + 1);
    let owners = vec![Address([11; 20]), Address([12; 20])];
    let subnet = e
        .issue(UnsignedTx::CreateSubnet {
            owners: owners.clone(),
            threshold: 2,
            payer: PAYER,
            fee: 0,
        })
        .unwrap();
    let node = NodeId::random();
    let v_end = T0 + 10 + 10 * DAY;
    e.issue(add_validator(node, 1_000 * UNITS, T0 + 10, v_end, Some(3)))
        .unwrap();
    e.step();

    let join = |start, end| UnsignedTx::AddSubnetValidator {
        node_id: node,
        subnet_id: subnet,
        start_time: start,
        end_time: end,
        weight: 7,
        subnet_auth: vec![0, 1],
        payer: PAYER,
        fee: 0,
    };
    let leave = |fee| UnsignedTx::RemoveSubnetValidator {
        node_id: node,
        subnet_id: subnet,
        subnet_auth: vec![0, 1],
        payer: PAYER,
        fee,
    };
    let signers = vec![owners[0], owners[1], PAYER];

    // both owners have to sign
    assert!(matches!(
        e.vm.issue_tx(signed(join(T0 + 20, T0 + DAY), &[owners[0], PAYER])),
        Err(Error::Malformed(_))
    ));
    // and so does the payer
    assert!(matches!(
        e.vm.issue_tx(signed(join(T0 + 20, T0 + DAY), &owners)),
        Err(Error::Malformed(_))
    ));
    let mut below_threshold = join(T0 + 20, T0 + DAY);
    if let UnsignedTx::AddSubnetValidator { subnet_auth, .. } = &mut below_threshold {
        *subnet_auth = vec![1];
    }
    assert!(matches!(
        e.vm.issue_tx(signed(below_threshold, &signers)),
        Err(Error::Malformed(_))
    ));
    // outlives the primary validator
    assert!(matches!(
        e.vm.issue_tx(signed(join(T0 + 20, v_end + 1), &signers)),
        Err(Error::InvalidTiming(_))
    ));
    e.vm.issue_tx(signed(join(T0 + 20, T0 + DAY), &signers))
        .unwrap();
    e.step();

    e.clock.set(T0 + 100);
    e.step();
    e.step();
    assert_eq!(e.vm.timestamp(), T0 + 20);
    let joined_at = e.vm.height();
    let sv = e.vm.current_validator(&subnet, &node).unwrap();
    assert_eq!(sv.bls_key, Some(bls(3)));
    assert_eq!(
        e.vm.validator_set(&subnet)[&node],
        ValidatorEntry {
            weight: 7,
            bls_key: Some(bls(3)),
        }
    );

    // removed while current
    let left = signed(leave(0), &signers);
    e.vm.issue_tx(left.clone()).unwrap();
    e.step();
    assert!(e.vm.validator_set(&subnet).is_empty());
    assert!(e
        .vm
        .validator_set_at(joined_at, &subnet)
        .unwrap()
        .contains_key(&node));

    // removed while pending
    e.vm.issue_tx(signed(join(T0 + 2 * DAY, v_end), &signers))
        .unwrap();
    e.step();
    assert!(e.vm.pending_validator(&subnet, &node).is_ok());
    e.vm.issue_tx(signed(leave(1), &signers)).unwrap();
    e.step();
    assert!(matches!(
        e.vm.pending_validator(&subnet, &node),
        Err(Error::NotFound(_))
    ));

    // leaves together with its primary validator
    e.vm.issue_tx(signed(join(T0 + 2 * DAY + 1, v_end), &signers))
        .unwrap();
    e.step();
    assert!(e.vm.pending_validator(&subnet, &node).is_ok());

    // an accepted removal can not be replayed, however its credentials are
    // ordered
    assert!(matches!(e.vm.issue_tx(left.clone()), Err(Error::Conflict(_))));
    let reordered = signed(leave(0), &[PAYER, owners[1], owners[0]]);
    assert_ne!(reordered.id(), left.id());
    assert!(matches!(e.vm.issue_tx(reordered.clone()), Err(Error::Conflict(_))));
    let replay = Block::new(
        e.vm.last_accepted(),
        e.vm.height() + 1,
        e.vm.timestamp(),
        BlockKind::Standard {
            txs: vec![reordered],
        },
    )
    .unwrap();
    assert!(matches!(e.vm.verify(&replay), Err(Error::Conflict(_))));
    assert!(e.vm.pending_validator(&subnet, &node).is_ok());

    e.clock.set(v_end + 100);
    e.step();
    let rejoined_at = e.vm.height();
    e.step();
    assert_eq!(e.vm.timestamp(), v_end);
    assert!(e.vm.validator_set(&subnet).is_empty());
    e.decide(true);

    assert!(!e.vm.validator_set(&PRIMARY_NETWORK_ID).contains_key(&node));
    let past = e.vm.validator_set_at(rejoined_at, &subnet).unwrap();
    assert_eq!(past[&node].bls_key, Some(bls(3)));
    assert_eq!(past[&node].weight, 7);
}

#[test]
fn concurrent_readers_see_consistent_history() {
    let e = Env::new();
    let done = AtomicBool::new(false);
    let observed = Mutex::new(vec![]);
    let mut accepts = 0;

    thread::scope(|s| {
        for _ in 0..24 {
            s.spawn(|| {
                let mut seen = vec![];
                loop {
                    let from = NodeId::random();
                    let tip = match e.vm.app_request(from, u64::MAX, &AppRequest::CurrentHeight) {
                        Ok(Some(AppResponse::CurrentHeight(h))) => h,
                        other => panic!("unexpected {other:?}"),
                    };
                    let height = rand::random::<u64>() % (tip + 1);
                    let req = AppRequest::ValidatorSet {
                        height,
                        subnet_id: PRIMARY_NETWORK_ID,
                    };
                    match e.vm.app_request(from, u64::MAX, &req) {
                        Ok(Some(AppResponse::ValidatorSet { height, validators })) => {
                            if seen.len() < 256 {
                                seen.push((height, validators))
                            }
                        }
                        other => panic!("unexpected {other:?}"),
                    }
                    if done.load(Ordering::SeqCst) {
                        break;
                    }
                }
                observed.lock().extend(seen);
            });
        }

        // every round stages a validator, promotes the previous one and,
        // from the fourth round on, settles the one staged three rounds ago
        for i in 0..60 {
            let now = T0 + 100 * (i + 1);
            e.clock.set(now);
            e.issue(add_validator(NodeId::random(), UNITS, now + 5, now + 255, None))
                .unwrap();
            loop {
                let block = match e.vm.build_block() {
                    Ok(b) => b,
                    Err(Error::NothingToBuild) => break,
                    Err(err) => panic!("unexpected {err:?}"),
                };
                if let BlockKind::Proposal { .. } = block.kind() {
                    e.decide_on(&block, i % 2 == 0);
                    accepts += 2;
                } else {
                    e.vm.verify(&block).unwrap();
                    e.vm.accept(&block.id()).unwrap();
                    accepts += 1;
                }
            }
        }
        done.store(true, Ordering::SeqCst);
    });

    assert!(accepts >= 200);
    assert_eq!(e.vm.height(), accepts);
    let observed = observed.into_inner();
    assert!(observed.len() >= 24);
    for (height, validators) in observed {
        let now: Vec<(NodeId, ValidatorEntry)> = e
            .vm
            .validator_set_at(height, &PRIMARY_NETWORK_ID)
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(validators, now);
    }
    // genesis plus at most three overlapping windows
    let last = e.vm.validator_set(&PRIMARY_NETWORK_ID).len();
    assert!((2..=4).contains(&last));
}

#[test]
fn accepting_prunes_losing_forks() {
    let e = Env::new();
    e.clock.set(T0 + 1);
    e.issue(add_validator(NodeId::random(), UNITS, T0 + 10, T0 + 100, None))
        .unwrap();
    let b1 = e.vm.build_block().unwrap();
    e.vm.verify(&b1).unwrap();

    e.clock.set(T0 + 2);
    let shared = b1.txs()[0].clone();
    let b2 = Block::new(
        b1.parent_id(),
        1,
        T0 + 2,
        BlockKind::Standard { txs: vec![shared] },
    )
    .unwrap();
    e.vm.verify(&b2).unwrap();
    let own = signed(
        add_validator(NodeId::random(), UNITS, T0 + 20, T0 + 100, None),
        &[PAYER],
    );
    let b3 = Block::new(b2.id(), 2, T0 + 2, BlockKind::Standard { txs: vec![own] }).unwrap();
    e.vm.verify(&b3).unwrap();
    // a block whose parent never showed up stays until its height is decided
    let orphan = Block::new(Id::random(), 3, T0 + 2, BlockKind::Commit).unwrap();
    assert!(e.vm.verify(&orphan).is_err());
    assert_eq!(e.vm.chain.read().blocks.len(), 4);

    e.vm.accept(&b1.id()).unwrap();
    for b in [&b2, &b3] {
        assert_eq!(e.vm.get_block(&b.id()).unwrap().1, Status::Rejected);
    }
    // only the tx nobody applied goes back
    assert_eq!(e.vm.mempool_len(), 1);
    assert_eq!(e.vm.chain.read().blocks.len(), 1);
    assert_eq!(e.vm.get_block(&orphan.id()).unwrap().1, Status::Processing);
    assert!(matches!(e.vm.verify(&b3), Err(Error::Conflict(_))));

    e.clock.set(T0 + 50);
    e.step();
    e.step();
    assert_eq!(e.vm.height(), 3);
    assert!(e.vm.chain.read().blocks.is_empty());
    assert_eq!(e.vm.get_block(&orphan.id()).unwrap().1, Status::Rejected);
}

#[test]
fn payers_fund_stake_and_fees() {
    let mut cfg = test_cfg();
    cfg.add_primary_network_validator_fee = 3;
    let e = Env::with(cfg, Arc::new(MemDB::new()));
    e.clock.set(T0 + 1);
    let node = NodeId::random();
    let mut tx = add_validator(node, 1_000 * UNITS, T0 + 10, T0 + 10 + DAY, None);

    let broke = Address([13; 20]);
    if let UnsignedTx::AddValidator { payer, fee, .. } = &mut tx {
        *payer = broke;
        *fee = 3;
    }
    assert_eq!(
        e.vm.issue_tx(signed(tx.clone(), &[broke])),
        Err(Error::InsufficientFee {
            required: 1_000 * UNITS + 3,
            provided: 0
        })
    );
    // a funded payer has to sign for itself
    if let UnsignedTx::AddValidator { payer, .. } = &mut tx {
        *payer = PAYER;
    }
    assert!(matches!(
        e.vm.issue_tx(signed(tx.clone(), &[broke])),
        Err(Error::Malformed(_))
    ));
    e.issue(tx).unwrap();
    e.step();
    assert_eq!(e.vm.balance(&PAYER), FUNDS - 1_000 * UNITS - 3);

    e.clock.set(T0 + 10 + 2 * DAY);
    e.step();
    let reward = e
        .vm
        .current_validator(&PRIMARY_NETWORK_ID, &node)
        .unwrap()
        .potential_reward;
    e.step();
    e.decide(true);
    assert_eq!(e.vm.balance(&Address(node.0)), 1_000 * UNITS + reward);
    assert_eq!(e.vm.balance(&PAYER), FUNDS - 1_000 * UNITS - 3);
}

#[test]
fn global_config_opens_a_chain() {
    let mut g = genesis(NodeId::random());
    g.validators[0].delegation_fee = 20_000;
    let memory = Memory::new();
    let vm = Vm::with_global_cfg(
        Arc::new(MemDB::new()),
        &g,
        memory.new_shared_memory(CHAIN),
        Arc::new(DigestVerifier),
        Arc::new(MockClock::new(T0)),
    )
    .unwrap();
    assert_eq!(*vm.cfg, *global_cfg::CFG);
    assert_eq!(vm.height(), 0);
    assert_eq!(vm.validator_set(&PRIMARY_NETWORK_ID).len(), 1);
    assert_eq!(vm.balance(&PAYER), FUNDS);
}

struct FlakyDb {
    inner: MemDB,
    fail: AtomicBool,
}

impl KvStore for FlakyDb {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<KValue>> {
        self.inner.iter_prefix(prefix)
    }

    fn commit(&self, batch: KVBatch) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::fatal("disk full"));
        }
        self.inner.commit(batch)
    }
}

#[test]
fn failed_write_halts_the_chain() {
    let db = Arc::new(FlakyDb {
        inner: MemDB::new(),
        fail: AtomicBool::new(false),
    });
    let e = Env::with(test_cfg(), db.clone());
    e.clock.set(T0 + 1);
    e.issue(add_validator(NodeId::random(), UNITS, T0 + 10, T0 + 100, None))
        .unwrap();
    let block = e.vm.build_block().unwrap();
    e.vm.verify(&block).unwrap();

    db.fail.store(true, Ordering::SeqCst);
    assert!(matches!(e.vm.accept(&block.id()), Err(Error::Fatal(_))));
    assert_eq!(e.vm.height(), 0);

    db.fail.store(false, Ordering::SeqCst);
    assert!(matches!(e.vm.accept(&block.id()), Err(Error::Fatal(_))));
    assert!(matches!(e.vm.build_block(), Err(Error::Fatal(_))));
    assert!(matches!(
        e.issue(add_validator(NodeId::random(), UNITS, T0 + 10, T0 + 100, None)),
        Err(Error::Fatal(_))
    ));
    // reads keep working on the last good state
    assert_eq!(
        e.vm.validator_set_at(0, &PRIMARY_NETWORK_ID).unwrap().len(),
        1
    );
}

#[test]
fn app_requests_honour_deadlines() {
    let e = Env::new();
    e.clock.set(T0 + 50);
    let from = NodeId::random();
    let req = AppRequest::CurrentHeight;
    assert_eq!(e.vm.app_request(from, T0 + 49, &req).unwrap(), None);
    assert_eq!(
        e.vm.app_request(from, T0 + 50, &req).unwrap(),
        Some(AppResponse::CurrentHeight(0))
    );

    let bytes = serde_json::to_vec(&AppRequest::Validator {
        subnet_id: PRIMARY_NETWORK_ID,
        node_id: e.genesis_node,
    })
    .unwrap();
    let resp = e
        .vm
        .app_request_bytes(from, T0 + 60, &bytes)
        .unwrap()
        .unwrap();
    let resp: AppResponse = serde_json::from_slice(&resp).unwrap();
    match resp {
        AppResponse::Validator(Some(s)) => {
            assert_eq!(s.node_id, e.genesis_node);
            assert_eq!(s.bls_key, Some(bls(9)));
        }
        other => panic!("unexpected {other:?}"),
    }

    let stranger = AppRequest::Validator {
        subnet_id: PRIMARY_NETWORK_ID,
        node_id: NodeId::random(),
    };
    assert_eq!(
        e.vm.app_request(from, T0 + 60, &stranger).unwrap(),
        Some(AppResponse::Validator(None))
    );
    let future = AppRequest::ValidatorSet {
        height: 3,
        subnet_id: PRIMARY_NETWORK_ID,
    };
    assert_eq!(
        e.vm.app_request(from, T0 + 60, &future),
        Err(Error::NotFound(NotFound::Height(3)))
    );
    assert!(matches!(
        e.vm.app_request_bytes(from, T0 + 60, b"{"),
        Err(Error::Codec(_))
    ));
}
