//! Per-account ledger of unspent output references. A [`Balance`] is the
//! state of every account at one block; validators advance it forward, never
//! backward. A rollback is expressed by rebuilding from genesis on a fresh
//! value.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use lode_core::{
    transfer_message, validate_reward, Address, Block, Blockchain, Hash, Transaction, TxKind,
};
use lode_crypto::{CryptoProvider, Keychain};

/// Unspent output references per address, oldest first.
pub type Accounts = HashMap<Address, Vec<Hash>>;

/// Invariant breakage inside ledger bookkeeping. These indicate a bug in the
/// caller (applying a block that was never validated) or corrupt input, not
/// an invalid-but-well-formed chain.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("chain has no blocks")]
    EmptyChain,
    #[error("block {} missing from the index", hex::encode(.0))]
    MissingBlock(Hash),
    #[error("account {} does not hold reference {}", hex::encode(.sender), hex::encode(.reference))]
    MissingReference { sender: Address, reference: Hash },
}

/// Why a transaction was rejected against a given balance.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("reward does not match the protocol convention")]
    MalformedReward,
    #[error("sender has no unspent outputs")]
    UnknownSender,
    #[error("no verifying key for sender")]
    MissingKey,
    #[error("reference already spent or never created")]
    DoubleSpend,
    #[error("signature rejected")]
    BadSignature,
}

/// Ledger snapshot at `latest_hash`. Without a keychain the snapshot can
/// still be advanced, but transfers cannot be validated against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub latest_hash: Hash,
    pub keychain: Option<Keychain>,
    pub accounts: Accounts,
}

fn remove_reference(
    accounts: &mut Accounts,
    sender: &Address,
    reference: &Hash,
) -> Result<(), LedgerError> {
    let missing = || LedgerError::MissingReference {
        sender: *sender,
        reference: *reference,
    };
    let entries = accounts.get_mut(sender).ok_or_else(missing)?;
    let position = entries
        .iter()
        .position(|entry| entry == reference)
        .ok_or_else(missing)?;
    entries.remove(position);
    Ok(())
}

/// Folds every transaction of `block` into `accounts`, in block order: a
/// transfer first consumes its reference from the sender, then every
/// transaction appends its own output reference to the receiver.
pub fn update_accounts(accounts: &mut Accounts, block: &Block) -> Result<(), LedgerError> {
    for transaction in &block.transactions {
        if transaction.kind() == TxKind::Transfer {
            remove_reference(accounts, &transaction.sender, &transaction.reference_hash)?;
        }
        accounts
            .entry(transaction.receiver)
            .or_default()
            .push(transaction.reference());
    }
    Ok(())
}

/// Replays the whole chain into a fresh snapshot.
pub fn init_balance(
    blockchain: &Blockchain,
    keychain: Option<Keychain>,
) -> Result<Balance, LedgerError> {
    let latest_hash = *blockchain.chain.last().ok_or(LedgerError::EmptyChain)?;
    let mut accounts = Accounts::new();
    for block_hash in &blockchain.chain {
        let block = blockchain
            .blocks
            .get(block_hash)
            .ok_or(LedgerError::MissingBlock(*block_hash))?;
        update_accounts(&mut accounts, block)?;
    }
    Ok(Balance {
        latest_hash,
        keychain,
        accounts,
    })
}

/// Advances the snapshot by one block.
pub fn update_balance(balance: &mut Balance, block: &Block) -> Result<(), LedgerError> {
    update_accounts(&mut balance.accounts, block)?;
    balance.latest_hash = block.hash();
    Ok(())
}

/// Builds the sender's next outbound transfer without recording the spend.
/// Wallets spend oldest-first; `None` means the account has nothing left.
pub fn propose_transfer(
    balance: &Balance,
    sender: Address,
    receiver: Address,
    signature: Vec<u8>,
) -> Option<Transaction> {
    let reference_hash = *balance.accounts.get(&sender)?.first()?;
    Some(Transaction {
        reference_hash,
        sender,
        receiver,
        signature,
    })
}

/// Records a proposed transfer's spend, making the reference unavailable to
/// further proposals and validations on this snapshot.
pub fn apply_transfer(balance: &mut Balance, transaction: &Transaction) -> Result<(), LedgerError> {
    remove_reference(
        &mut balance.accounts,
        &transaction.sender,
        &transaction.reference_hash,
    )
}

/// Checks one transaction against the snapshot. Rewards bypass the accounts
/// and are checked structurally. Transfers may spend any reference still in
/// the sender's list, not just the oldest.
pub fn validate_transaction<C: CryptoProvider>(
    balance: &Balance,
    transaction: &Transaction,
    crypto: &C,
) -> Result<(), TxError> {
    if transaction.kind() == TxKind::Reward {
        if validate_reward(transaction) {
            return Ok(());
        }
        return Err(TxError::MalformedReward);
    }

    let entries = balance
        .accounts
        .get(&transaction.sender)
        .filter(|entries| !entries.is_empty())
        .ok_or(TxError::UnknownSender)?;
    let key = balance
        .keychain
        .as_ref()
        .and_then(|keychain| keychain.get(&transaction.sender))
        .ok_or(TxError::MissingKey)?;
    if !entries.contains(&transaction.reference_hash) {
        return Err(TxError::DoubleSpend);
    }

    let message = transfer_message(&transaction.reference_hash, &transaction.receiver);
    match crypto.verify_signature(key, &message, &transaction.signature) {
        Ok(true) => Ok(()),
        _ => Err(TxError::BadSignature),
    }
}
