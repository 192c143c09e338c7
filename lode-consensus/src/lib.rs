//! Consensus rules: the proof-of-work target, the mining loop, block and
//! chain validation, and the longest-chain replacement rule.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use lode_core::{
    init_reward, merkle_root, nonce_from_u64, nonce_succ, Address, Block, Blockchain, Hash, Header,
    Nonce, VERSION,
};
use lode_crypto::CryptoProvider;
use lode_ledger::{init_balance, update_balance, validate_transaction, Balance, LedgerError, TxError};

/// Leading zero bytes a block hash must carry. Fixed; there is no
/// retargeting.
pub const POW_ZERO_BYTES: usize = 2;

pub const GENESIS_TIMESTAMP: u32 = 1_634_700_000;

/// Nonce the genesis proof-of-work search starts from.
pub const GENESIS_NONCE_SEED: u64 = 48_705;

pub fn meets_pow(block_hash: &Hash) -> bool {
    block_hash[..POW_ZERO_BYTES].iter().all(|&byte| byte == 0)
}

/// Why a block or chain was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("previous hash does not match the parent")]
    BadLink,
    #[error("timestamp earlier than the parent's")]
    TimestampRegression,
    #[error("proof-of-work target not met")]
    BadPow,
    #[error("merkle root does not commit to the block's transactions")]
    MerkleMismatch,
    #[error("block carries no transactions")]
    EmptyBlock,
    #[error("balance tip {} is not on this chain", hex::encode(.0))]
    UnknownTip(Hash),
    #[error("candidate chain is not longer than the current chain")]
    NotLonger,
    #[error("transaction {index} rejected: {source}")]
    Transaction { index: usize, source: TxError },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Outcome of a bounded or unbounded nonce search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MineOutcome {
    /// A nonce satisfying the target was found.
    Sealed { header: Header, block_hash: Hash },
    /// The iteration budget ran out; resume the search at `next_nonce`.
    OutOfIterations { next_nonce: Nonce },
}

/// Scans nonces from `nonce` upward until the double-hashed header meets the
/// target. With an iteration budget this is the cooperative yield point: the
/// caller interleaves other work and resumes at the returned nonce.
pub fn mine(
    previous_hash: Hash,
    merkle_root: Hash,
    timestamp: u32,
    mut nonce: Nonce,
    iterations: Option<u64>,
) -> MineOutcome {
    let mut tried: u64 = 0;
    loop {
        if iterations == Some(tried) {
            return MineOutcome::OutOfIterations { next_nonce: nonce };
        }
        let header = Header {
            version: VERSION,
            previous_hash,
            merkle_root,
            timestamp,
            nonce,
        };
        let block_hash = header.hash();
        if meets_pow(&block_hash) {
            debug!("sealed header {} after {} tries", hex::encode(block_hash), tried + 1);
            return MineOutcome::Sealed { header, block_hash };
        }
        nonce = nonce_succ(&nonce);
        tried += 1;
    }
}

/// Builds the genesis block paying `receiver`. The proof-of-work search is
/// seeded at the protocol constant, so construction is deterministic for a
/// given receiver and the sealed header always meets the target.
pub fn genesis_block(receiver: Address) -> Block {
    let reward = init_reward(receiver);
    let leaves = [reward.reference()];
    let root = merkle_root(&leaves).expect("one leaf");
    match mine(
        [0u8; 32],
        root,
        GENESIS_TIMESTAMP,
        nonce_from_u64(GENESIS_NONCE_SEED),
        None,
    ) {
        MineOutcome::Sealed { header, .. } => Block {
            header,
            transactions: vec![reward],
        },
        MineOutcome::OutOfIterations { .. } => unreachable!("search was unbounded"),
    }
}

/// A one-block chain rooted at a fresh genesis.
pub fn init_blockchain(receiver: Address) -> Blockchain {
    Blockchain::new(genesis_block(receiver))
}

/// Checks linkage, timestamp monotonicity (non-strict) and proof-of-work.
/// Returns the header's hash and timestamp for the next link.
pub fn validate_header(
    header: &Header,
    previous_hash: &Hash,
    previous_timestamp: u32,
) -> Result<(Hash, u32), ChainError> {
    if header.previous_hash != *previous_hash {
        return Err(ChainError::BadLink);
    }
    if header.timestamp < previous_timestamp {
        return Err(ChainError::TimestampRegression);
    }
    let block_hash = header.hash();
    if !meets_pow(&block_hash) {
        return Err(ChainError::BadPow);
    }
    Ok((block_hash, header.timestamp))
}

/// Replays blocks against a ledger snapshot, advancing it on success.
pub struct ChainValidator<'a, C: CryptoProvider> {
    crypto: &'a C,
}

impl<'a, C: CryptoProvider> ChainValidator<'a, C> {
    pub fn new(crypto: &'a C) -> Self {
        Self { crypto }
    }

    /// Validates one block against the state at its parent. Every
    /// transaction is checked against the balance as of the start of the
    /// block: outputs created earlier in the same block are not spendable by
    /// later transactions in it.
    pub fn validate_block(
        &self,
        block: &Block,
        previous_hash: &Hash,
        previous_timestamp: u32,
        balance: &Balance,
    ) -> Result<(Hash, u32), ChainError> {
        let (block_hash, timestamp) =
            validate_header(&block.header, previous_hash, previous_timestamp)?;

        let leaves: Vec<Hash> = block.transactions.iter().map(|tx| tx.reference()).collect();
        let root = merkle_root(&leaves).ok_or(ChainError::EmptyBlock)?;
        if root != block.header.merkle_root {
            return Err(ChainError::MerkleMismatch);
        }

        for (index, transaction) in block.transactions.iter().enumerate() {
            validate_transaction(balance, transaction, self.crypto)
                .map_err(|source| ChainError::Transaction { index, source })?;
        }
        Ok((block_hash, timestamp))
    }

    /// Replays `blockchain` from the balance's tip to the end. The balance
    /// is taken by value and only returned once the whole suffix validated,
    /// so a mid-chain failure leaves no half-advanced state observable.
    /// Genesis itself is treated as pre-validated.
    pub fn validate_blockchain(
        &self,
        blockchain: &Blockchain,
        mut balance: Balance,
    ) -> Result<Balance, ChainError> {
        let start = blockchain
            .chain
            .iter()
            .position(|block_hash| *block_hash == balance.latest_hash)
            .ok_or(ChainError::UnknownTip(balance.latest_hash))?;

        // The parent of the first replayed block supplies the timestamp
        // floor; at genesis the block is its own predecessor.
        let anchor_hash = blockchain.chain[start.saturating_sub(1)];
        let anchor = blockchain
            .blocks
            .get(&anchor_hash)
            .ok_or(LedgerError::MissingBlock(anchor_hash))?;
        let mut previous_timestamp = anchor.header.timestamp;
        let mut previous_hash = balance.latest_hash;

        for block_hash in &blockchain.chain[start + 1..] {
            let block = blockchain
                .blocks
                .get(block_hash)
                .ok_or(LedgerError::MissingBlock(*block_hash))?;
            let (current_hash, current_timestamp) =
                self.validate_block(block, &previous_hash, previous_timestamp, &balance)?;
            update_balance(&mut balance, block)?;
            debug!("accepted block {}", hex::encode(current_hash));
            previous_hash = current_hash;
            previous_timestamp = current_timestamp;
        }
        Ok(balance)
    }

    /// Longest-chain rule: adopt `candidate` only if it is strictly longer
    /// than `current` and fully valid. If the current balance sits on the
    /// prefix the chains share, validation continues from it; if it has
    /// advanced into a branch the candidate does not share, the ledger is
    /// rebuilt from the candidate's genesis and the whole candidate is
    /// replayed.
    pub fn replace_blockchain(
        &self,
        candidate: &Blockchain,
        current: &Blockchain,
        current_balance: &Balance,
    ) -> Result<Balance, ChainError> {
        if candidate.chain.len() <= current.chain.len() {
            return Err(ChainError::NotLonger);
        }

        let divergence = current
            .chain
            .iter()
            .zip(&candidate.chain)
            .position(|(ours, theirs)| ours != theirs)
            .unwrap_or(current.chain.len());
        let tip_index = current
            .chain
            .iter()
            .position(|block_hash| *block_hash == current_balance.latest_hash)
            .ok_or(ChainError::UnknownTip(current_balance.latest_hash))?;

        if tip_index <= divergence {
            info!("candidate extends the known prefix, validating from the current balance");
            return self.validate_blockchain(candidate, current_balance.clone());
        }

        let genesis_view = candidate
            .genesis_only()
            .ok_or(ChainError::Ledger(LedgerError::EmptyChain))?;
        let genesis_balance = init_balance(&genesis_view, current_balance.keychain.clone())?;
        info!("balance is past the fork point, replaying the candidate from genesis");
        self.validate_blockchain(candidate, genesis_balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lode_core::{transfer_message, Transaction};
    use lode_crypto::{demo_keychain, demo_wallets, DemoWallet, Ed25519Provider};
    use lode_ledger::{apply_transfer, propose_transfer};
    use std::collections::BTreeMap;

    const T0: u32 = GENESIS_TIMESTAMP;

    fn seal(previous_hash: Hash, timestamp: u32, transactions: Vec<Transaction>) -> Block {
        let leaves: Vec<Hash> = transactions.iter().map(|tx| tx.reference()).collect();
        let root = merkle_root(&leaves).unwrap();
        match mine(previous_hash, root, timestamp, nonce_from_u64(0), None) {
            MineOutcome::Sealed { header, .. } => Block {
                header,
                transactions,
            },
            MineOutcome::OutOfIterations { .. } => unreachable!(),
        }
    }

    fn wallets() -> BTreeMap<u16, DemoWallet> {
        demo_wallets()
    }

    fn signed_transfer(balance: &Balance, sender: &DemoWallet, receiver: Address) -> Transaction {
        let provider = Ed25519Provider::new();
        let unsigned =
            propose_transfer(balance, sender.address, receiver, Vec::new()).expect("unspent output");
        let message = transfer_message(&unsigned.reference_hash, &unsigned.receiver);
        let signature = provider.sign_message(&sender.secret_key, &message).unwrap();
        Transaction {
            signature,
            ..unsigned
        }
    }

    #[test]
    fn genesis_is_self_consistent() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let block = genesis_block(miner.address);

        assert!(meets_pow(&block.hash()));
        assert_eq!(block.header.version, VERSION);
        assert_eq!(block.header.previous_hash, [0u8; 32]);
        assert_eq!(block.header.timestamp, GENESIS_TIMESTAMP);
        assert_eq!(
            block.header.merkle_root,
            init_reward(miner.address).reference()
        );

        let blockchain = init_blockchain(miner.address);
        assert_eq!(blockchain.chain[0], block.hash());

        let balance = init_balance(&blockchain, Some(demo_keychain())).unwrap();
        assert_eq!(balance.latest_hash, block.hash());
        assert_eq!(balance.accounts.len(), 1);
        assert_eq!(
            balance.accounts[&miner.address],
            vec![init_reward(miner.address).reference()]
        );
    }

    #[test]
    fn genesis_construction_is_deterministic() {
        let miner = wallets()[&7000].address;
        assert_eq!(genesis_block(miner), genesis_block(miner));
    }

    #[test]
    fn bounded_mining_resumes_where_it_stopped() {
        let root = sha256_root();

        let stopped = mine([0u8; 32], root, T0, nonce_from_u64(7), Some(0));
        assert_eq!(
            stopped,
            MineOutcome::OutOfIterations {
                next_nonce: nonce_from_u64(7)
            }
        );

        // Mine in small slices and check the result matches one long run.
        let mut nonce = nonce_from_u64(0);
        let sealed = loop {
            match mine([0u8; 32], root, T0, nonce, Some(5_000)) {
                MineOutcome::Sealed { header, block_hash } => break (header, block_hash),
                MineOutcome::OutOfIterations { next_nonce } => nonce = next_nonce,
            }
        };
        assert!(meets_pow(&sealed.1));
        match mine([0u8; 32], root, T0, nonce_from_u64(0), None) {
            MineOutcome::Sealed { header, block_hash } => {
                assert_eq!((header, block_hash), sealed);
            }
            MineOutcome::OutOfIterations { .. } => unreachable!(),
        }
    }

    fn sha256_root() -> Hash {
        lode_core::sha256(b"mining fixture")
    }

    #[test]
    fn reward_and_transfer_block_advances_the_balance() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let payee = &wallets[&8000];
        let provider = Ed25519Provider::new();
        let validator = ChainValidator::new(&provider);

        let mut blockchain = init_blockchain(miner.address);
        let balance = init_balance(&blockchain, Some(demo_keychain())).unwrap();

        let transfer = signed_transfer(&balance, miner, payee.address);
        let block = seal(
            blockchain.chain[0],
            T0 + 600,
            vec![init_reward(miner.address), transfer.clone()],
        );
        let block_hash = blockchain.push(block);

        let advanced = validator.validate_blockchain(&blockchain, balance).unwrap();
        assert_eq!(advanced.latest_hash, block_hash);
        assert_eq!(advanced.accounts.len(), 2);
        assert_eq!(
            advanced.accounts[&miner.address],
            vec![init_reward(miner.address).reference()]
        );
        assert_eq!(advanced.accounts[&payee.address], vec![transfer.reference()]);
    }

    #[test]
    fn spent_output_cannot_be_spent_again() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let payee = &wallets[&8000];
        let provider = Ed25519Provider::new();

        let blockchain = init_blockchain(miner.address);
        let mut balance = init_balance(&blockchain, Some(demo_keychain())).unwrap();

        let transfer = signed_transfer(&balance, miner, payee.address);
        apply_transfer(&mut balance, &transfer).unwrap();
        assert!(validate_transaction(&balance, &transfer, &provider).is_err());
    }

    #[test]
    fn zero_previous_hash_is_rejected_mid_chain() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let provider = Ed25519Provider::new();
        let validator = ChainValidator::new(&provider);

        let mut blockchain = init_blockchain(miner.address);
        let balance = init_balance(&blockchain, Some(demo_keychain())).unwrap();
        blockchain.push(seal(
            blockchain.chain[0],
            T0 + 600,
            vec![init_reward(miner.address)],
        ));

        // Deliberately anchored to zero instead of the current tip.
        blockchain.push(seal(
            [0u8; 32],
            T0 + 1_200,
            vec![init_reward(miner.address)],
        ));

        assert_eq!(
            validator.validate_blockchain(&blockchain, balance),
            Err(ChainError::BadLink)
        );
    }

    #[test]
    fn timestamp_regression_is_rejected() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let provider = Ed25519Provider::new();
        let validator = ChainValidator::new(&provider);

        let mut blockchain = init_blockchain(miner.address);
        let balance = init_balance(&blockchain, Some(demo_keychain())).unwrap();
        blockchain.push(seal(
            blockchain.chain[0],
            T0 - 1,
            vec![init_reward(miner.address)],
        ));

        assert_eq!(
            validator.validate_blockchain(&blockchain, balance),
            Err(ChainError::TimestampRegression)
        );
    }

    #[test]
    fn equal_timestamp_is_accepted() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let provider = Ed25519Provider::new();
        let validator = ChainValidator::new(&provider);

        let mut blockchain = init_blockchain(miner.address);
        let balance = init_balance(&blockchain, Some(demo_keychain())).unwrap();
        blockchain.push(seal(
            blockchain.chain[0],
            T0,
            vec![init_reward(miner.address)],
        ));

        assert!(validator.validate_blockchain(&blockchain, balance).is_ok());
    }

    #[test]
    fn merkle_root_must_commit_to_the_transactions() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let provider = Ed25519Provider::new();
        let validator = ChainValidator::new(&provider);

        let mut blockchain = init_blockchain(miner.address);
        let balance = init_balance(&blockchain, Some(demo_keychain())).unwrap();

        // Seal a one-transaction header, then ship it with an extra
        // transaction the root never committed to.
        let mut block = seal(blockchain.chain[0], T0 + 600, vec![init_reward(miner.address)]);
        block.transactions.push(init_reward(miner.address));
        blockchain.push(block);

        assert_eq!(
            validator.validate_blockchain(&blockchain, balance),
            Err(ChainError::MerkleMismatch)
        );
    }

    #[test]
    fn outputs_created_in_a_block_are_invisible_within_it() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let payee = &wallets[&8000];
        let provider = Ed25519Provider::new();
        let validator = ChainValidator::new(&provider);

        let mut blockchain = init_blockchain(miner.address);
        let balance = init_balance(&blockchain, Some(demo_keychain())).unwrap();

        let first_spend = signed_transfer(&balance, miner, payee.address);
        // A spend of the output the first transfer creates, inside the same
        // block.
        let chained_reference = first_spend.reference();
        let message = transfer_message(&chained_reference, &miner.address);
        let signature = provider
            .sign_message(&payee.secret_key, &message)
            .unwrap();
        let chained_spend = Transaction {
            reference_hash: chained_reference,
            sender: payee.address,
            receiver: miner.address,
            signature,
        };
        blockchain.push(seal(
            blockchain.chain[0],
            T0 + 600,
            vec![init_reward(miner.address), first_spend, chained_spend],
        ));

        assert_eq!(
            validator.validate_blockchain(&blockchain, balance),
            Err(ChainError::Transaction {
                index: 2,
                source: TxError::UnknownSender,
            })
        );
    }

    #[test]
    fn failed_validation_returns_no_balance() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let provider = Ed25519Provider::new();
        let validator = ChainValidator::new(&provider);

        let mut blockchain = init_blockchain(miner.address);
        let balance = init_balance(&blockchain, Some(demo_keychain())).unwrap();
        let snapshot = balance.clone();

        // One good block, then a broken link: the good prefix must not leak.
        blockchain.push(seal(
            blockchain.chain[0],
            T0 + 600,
            vec![init_reward(miner.address)],
        ));
        blockchain.push(seal([0u8; 32], T0 + 1_200, vec![init_reward(miner.address)]));

        assert!(validator.validate_blockchain(&blockchain, balance).is_err());
        // The caller's snapshot still sits at genesis.
        assert_eq!(snapshot.latest_hash, blockchain.chain[0]);
        assert_eq!(snapshot.accounts[&miner.address].len(), 1);
    }

    #[test]
    fn replace_rejects_chains_of_equal_length() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let provider = Ed25519Provider::new();
        let validator = ChainValidator::new(&provider);

        let blockchain = init_blockchain(miner.address);
        let balance = init_balance(&blockchain, Some(demo_keychain())).unwrap();
        assert_eq!(
            validator.replace_blockchain(&blockchain, &blockchain, &balance),
            Err(ChainError::NotLonger)
        );
    }

    #[test]
    fn replace_accepts_a_strict_extension() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let provider = Ed25519Provider::new();
        let validator = ChainValidator::new(&provider);

        let current = init_blockchain(miner.address);
        let balance = init_balance(&current, Some(demo_keychain())).unwrap();

        let mut candidate = current.clone();
        let tip = candidate.push(seal(
            candidate.chain[0],
            T0 + 600,
            vec![init_reward(miner.address)],
        ));

        let adopted = validator
            .replace_blockchain(&candidate, &current, &balance)
            .unwrap();
        assert_eq!(adopted.latest_hash, tip);
        // The original balance is untouched by the replacement.
        assert_eq!(balance.latest_hash, current.chain[0]);
    }

    #[test]
    fn replace_replays_from_genesis_when_the_balance_left_the_prefix() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let payee = &wallets[&8000];
        let provider = Ed25519Provider::new();
        let validator = ChainValidator::new(&provider);

        let genesis = init_blockchain(miner.address);

        // Current branch: two blocks on top of genesis, balance at its tip.
        let mut current = genesis.clone();
        current.push(seal(
            current.chain[0],
            T0 + 600,
            vec![init_reward(miner.address)],
        ));
        current.push(seal(
            current.chain[1],
            T0 + 1_200,
            vec![init_reward(miner.address)],
        ));
        let current_balance = validator
            .validate_blockchain(
                &current,
                init_balance(&genesis, Some(demo_keychain())).unwrap(),
            )
            .unwrap();

        // Candidate branch: three different blocks on top of the same
        // genesis, paying the other wallet.
        let mut candidate = genesis.clone();
        for step in 1..=3u32 {
            candidate.push(seal(
                *candidate.tip().unwrap(),
                T0 + 600 * step,
                vec![init_reward(payee.address)],
            ));
        }

        let adopted = validator
            .replace_blockchain(&candidate, &current, &current_balance)
            .unwrap();
        assert_eq!(adopted.latest_hash, *candidate.tip().unwrap());
        // The adopted ledger reflects only the candidate branch: the genesis
        // reward for the miner, one (identical) reward per block for the
        // payee.
        assert_eq!(adopted.accounts[&miner.address].len(), 1);
        assert_eq!(adopted.accounts[&payee.address].len(), 3);
    }

    #[test]
    fn replace_rejects_an_invalid_longer_chain() {
        let wallets = wallets();
        let miner = &wallets[&7000];
        let provider = Ed25519Provider::new();
        let validator = ChainValidator::new(&provider);

        let current = init_blockchain(miner.address);
        let balance = init_balance(&current, Some(demo_keychain())).unwrap();

        let mut candidate = current.clone();
        candidate.push(seal(
            [0xeeu8; 32],
            T0 + 600,
            vec![init_reward(miner.address)],
        ));

        assert_eq!(
            validator.replace_blockchain(&candidate, &current, &balance),
            Err(ChainError::BadLink)
        );
    }
}
