// =============================================================================
// HELIOCOIN v1.6 - Wallet Storage (Sled Database)
// =============================================================================
//
// Persistent wallet state: coins with their blinding factors, transaction
// records, the per-transaction parameter table and the address book.
//
// Trees:
//   coins      coin_id (u64 BE)                      -> Coin
//   txs        tx_id (16 bytes)                      -> TxRecord
//   params     tx_id || sub_tx_id || param_id (BE)   -> value blob
//   addresses  wallet_id (32 bytes)                  -> AddressBookEntry
//
// =============================================================================

use sled::{Db, Tree};
use std::path::Path;

use serde::{Serialize, Deserialize};

use crate::crypto::{PedersenCommitment, Scalar};
use crate::params::{FailureReason, TxId, TxStatus, WalletId};

// =============================================================================
// Coins
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoinStatus {
    /// Confirmed and spendable
    Available,
    /// Reserved by an in-flight transaction
    Locked,
    /// Created by an in-flight transaction, not yet confirmed
    Incoming,
    Spent,
    Unavailable,
}

/// A wallet-owned output. The blinding factor never leaves the database
/// except inside signing math.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Coin {
    pub id: u64,
    pub amount: u64,
    pub blinding: Scalar,
    pub status: CoinStatus,
    /// Height from which the coin may be spent
    pub maturity: u64,
    pub created_by: Option<TxId>,
    pub spent_by: Option<TxId>,
}

impl Coin {
    pub fn commitment(&self) -> PedersenCommitment {
        PedersenCommitment::commit(self.amount, &self.blinding)
    }
}

// =============================================================================
// Transaction Records
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    Simple,
    AtomicSwap,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx_id: TxId,
    pub tx_type: TxType,
    pub status: TxStatus,
    pub failure_reason: Option<FailureReason>,
    pub created_at: u64,
}

// =============================================================================
// Address Book
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddressBookEntry {
    pub wallet_id: WalletId,
    pub comment: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub is_own: bool,
}

// =============================================================================
// Storage Engine
// =============================================================================

pub struct Storage {
    db: Db,
    coins: Tree,
    txs: Tree,
    params: Tree,
    addresses: Tree,
}

impl Storage {
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let db = sled::open(path).map_err(|e| format!("Failed to open database: {}", e))?;
        Self::from_db(db)
    }

    /// In-memory database for tests and tooling
    pub fn open_temporary() -> Result<Self, String> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| format!("Failed to open database: {}", e))?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, String> {
        let coins = db
            .open_tree("coins")
            .map_err(|e| format!("Failed to open coins tree: {}", e))?;
        let txs = db
            .open_tree("txs")
            .map_err(|e| format!("Failed to open txs tree: {}", e))?;
        let params = db
            .open_tree("params")
            .map_err(|e| format!("Failed to open params tree: {}", e))?;
        let addresses = db
            .open_tree("addresses")
            .map_err(|e| format!("Failed to open addresses tree: {}", e))?;

        Ok(Storage {
            db,
            coins,
            txs,
            params,
            addresses,
        })
    }

    // =========================================================================
    // Coins
    // =========================================================================

    pub fn put_coin(&self, coin: &Coin) -> Result<(), String> {
        let data = bincode::serialize(coin).map_err(|e| format!("Serialize error: {}", e))?;
        self.coins
            .insert(&coin.id.to_be_bytes(), data)
            .map_err(|e| format!("Insert error: {}", e))?;
        Ok(())
    }

    pub fn get_coin(&self, id: u64) -> Option<Coin> {
        self.coins
            .get(&id.to_be_bytes())
            .ok()?
            .and_then(|data| bincode::deserialize(&data).ok())
    }

    pub fn coins(&self) -> Vec<Coin> {
        self.coins
            .iter()
            .filter_map(|kv| kv.ok())
            .filter_map(|(_, data)| bincode::deserialize(&data).ok())
            .collect()
    }

    /// Inserts a fresh spendable coin (wallet funding, mining rewards)
    pub fn insert_available_coin(&self, amount: u64) -> Result<Coin, String> {
        let coin = Coin {
            id: self.db.generate_id().map_err(|e| format!("Id error: {}", e))?,
            amount,
            blinding: Scalar::random(),
            status: CoinStatus::Available,
            maturity: 0,
            created_by: None,
            spent_by: None,
        };
        self.put_coin(&coin)?;
        Ok(coin)
    }

    /// Allocates an output coin for a transaction being built. The coin is
    /// Incoming until the transaction confirms.
    pub fn create_coin(&self, amount: u64, created_by: TxId) -> Result<Coin, String> {
        let coin = Coin {
            id: self.db.generate_id().map_err(|e| format!("Id error: {}", e))?,
            amount,
            blinding: Scalar::random(),
            status: CoinStatus::Incoming,
            maturity: 0,
            created_by: Some(created_by),
            spent_by: None,
        };
        self.put_coin(&coin)?;
        Ok(coin)
    }

    /// Locks coins totalling at least `target`. Returns None on shortfall.
    /// Selection prefers an exact match, then the smallest sufficient single
    /// coin, then ascending accumulation.
    pub fn select_coins(&self, target: u64, spent_by: TxId) -> Result<Option<Vec<Coin>>, String> {
        let mut available: Vec<Coin> = self
            .coins()
            .into_iter()
            .filter(|c| c.status == CoinStatus::Available)
            .collect();
        available.sort_by_key(|c| c.amount);

        let chosen: Vec<Coin> = if let Some(exact) =
            available.iter().find(|c| c.amount == target)
        {
            vec![exact.clone()]
        } else if let Some(single) = available.iter().find(|c| c.amount > target) {
            vec![single.clone()]
        } else {
            let mut acc = Vec::new();
            let mut total = 0u64;
            for coin in &available {
                acc.push(coin.clone());
                total += coin.amount;
                if total >= target {
                    break;
                }
            }
            if total < target {
                return Ok(None);
            }
            acc
        };

        let mut locked = Vec::with_capacity(chosen.len());
        for mut coin in chosen {
            coin.status = CoinStatus::Locked;
            coin.spent_by = Some(spent_by);
            self.put_coin(&coin)?;
            locked.push(coin);
        }
        Ok(Some(locked))
    }

    /// Total of spendable coins
    pub fn available_total(&self) -> u64 {
        self.coins()
            .iter()
            .filter(|c| c.status == CoinStatus::Available)
            .map(|c| c.amount)
            .sum()
    }

    /// Marks the coin flow of one confirmed sub-transaction: the listed
    /// outputs become available at the proof height, the listed inputs
    /// become spent.
    pub fn settle_coins(
        &self,
        input_ids: &[u64],
        output_ids: &[u64],
        proof_height: u64,
    ) -> Result<(), String> {
        for id in input_ids {
            if let Some(mut coin) = self.get_coin(*id) {
                if coin.status == CoinStatus::Locked {
                    coin.status = CoinStatus::Spent;
                    self.put_coin(&coin)?;
                }
            }
        }
        for id in output_ids {
            if let Some(mut coin) = self.get_coin(*id) {
                if coin.status == CoinStatus::Incoming {
                    coin.status = CoinStatus::Available;
                    coin.maturity = proof_height;
                    self.put_coin(&coin)?;
                }
            }
        }
        Ok(())
    }

    /// Releases every coin touched by a failed transaction: locked inputs
    /// return to the spendable pool, unconfirmed outputs are dropped.
    pub fn rollback_tx(&self, tx_id: &TxId) -> Result<(), String> {
        for mut coin in self.coins() {
            if coin.spent_by == Some(*tx_id) && coin.status == CoinStatus::Locked {
                coin.status = CoinStatus::Available;
                coin.spent_by = None;
                self.put_coin(&coin)?;
            } else if coin.created_by == Some(*tx_id) && coin.status == CoinStatus::Incoming {
                self.coins
                    .remove(&coin.id.to_be_bytes())
                    .map_err(|e| format!("Remove error: {}", e))?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Transaction Records
    // =========================================================================

    pub fn put_tx_record(&self, record: &TxRecord) -> Result<(), String> {
        let data = bincode::serialize(record).map_err(|e| format!("Serialize error: {}", e))?;
        self.txs
            .insert(&record.tx_id.0, data)
            .map_err(|e| format!("Insert error: {}", e))?;
        Ok(())
    }

    pub fn get_tx_record(&self, tx_id: &TxId) -> Option<TxRecord> {
        self.txs
            .get(&tx_id.0)
            .ok()?
            .and_then(|data| bincode::deserialize(&data).ok())
    }

    pub fn tx_records(&self) -> Vec<TxRecord> {
        self.txs
            .iter()
            .filter_map(|kv| kv.ok())
            .filter_map(|(_, data)| bincode::deserialize(&data).ok())
            .collect()
    }

    pub fn update_tx_status(
        &self,
        tx_id: &TxId,
        status: TxStatus,
        failure_reason: Option<FailureReason>,
    ) -> Result<(), String> {
        if let Some(mut record) = self.get_tx_record(tx_id) {
            record.status = status;
            if failure_reason.is_some() {
                record.failure_reason = failure_reason;
            }
            self.put_tx_record(&record)?;
        }
        Ok(())
    }

    /// Permanently removes a transaction and its parameter bag
    pub fn delete_tx(&self, tx_id: &TxId) -> Result<(), String> {
        self.txs
            .remove(&tx_id.0)
            .map_err(|e| format!("Remove error: {}", e))?;
        let prefix = tx_id.0.to_vec();
        let keys: Vec<_> = self
            .params
            .scan_prefix(&prefix)
            .filter_map(|kv| kv.ok())
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            self.params
                .remove(key)
                .map_err(|e| format!("Remove error: {}", e))?;
        }
        Ok(())
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    fn param_key(tx_id: &TxId, sub_tx: u8, param: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(21);
        key.extend_from_slice(&tx_id.0);
        key.push(sub_tx);
        key.extend_from_slice(&param.to_be_bytes());
        key
    }

    pub fn get_param(&self, tx_id: &TxId, sub_tx: u8, param: u32) -> Option<Vec<u8>> {
        self.params
            .get(Self::param_key(tx_id, sub_tx, param))
            .ok()?
            .map(|v| v.to_vec())
    }

    pub fn set_param(
        &self,
        tx_id: &TxId,
        sub_tx: u8,
        param: u32,
        value: &[u8],
    ) -> Result<(), String> {
        self.params
            .insert(Self::param_key(tx_id, sub_tx, param), value)
            .map_err(|e| format!("Insert error: {}", e))?;
        Ok(())
    }

    // =========================================================================
    // Address Book
    // =========================================================================

    pub fn save_address(&self, entry: &AddressBookEntry) -> Result<(), String> {
        let data = bincode::serialize(entry).map_err(|e| format!("Serialize error: {}", e))?;
        self.addresses
            .insert(&entry.wallet_id.0, data)
            .map_err(|e| format!("Insert error: {}", e))?;
        Ok(())
    }

    pub fn get_address(&self, wallet_id: &WalletId) -> Option<AddressBookEntry> {
        self.addresses
            .get(&wallet_id.0)
            .ok()?
            .and_then(|data| bincode::deserialize(&data).ok())
    }

    pub fn addresses(&self) -> Vec<AddressBookEntry> {
        self.addresses
            .iter()
            .filter_map(|kv| kv.ok())
            .filter_map(|(_, data)| bincode::deserialize(&data).ok())
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_storage() -> Storage {
        Storage::open_temporary().unwrap()
    }

    #[test]
    fn test_coin_lifecycle() {
        let storage = temp_storage();
        let tx_id = TxId::generate();

        let coin = storage.insert_available_coin(500).unwrap();
        assert_eq!(storage.available_total(), 500);

        let selected = storage.select_coins(400, tx_id).unwrap().unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, coin.id);
        assert_eq!(storage.available_total(), 0);

        let out = storage.create_coin(99, tx_id).unwrap();
        assert_eq!(out.status, CoinStatus::Incoming);

        storage.settle_coins(&[coin.id], &[out.id], 120).unwrap();
        assert_eq!(storage.get_coin(coin.id).unwrap().status, CoinStatus::Spent);
        let confirmed = storage.get_coin(out.id).unwrap();
        assert_eq!(confirmed.status, CoinStatus::Available);
        assert_eq!(confirmed.maturity, 120);
    }

    #[test]
    fn test_selection_prefers_best_fit() {
        let storage = temp_storage();
        for amount in [5, 2, 1, 9] {
            storage.insert_available_coin(amount).unwrap();
        }

        // target 4: no exact match, smallest sufficient single coin is 5
        let selected = storage.select_coins(4, TxId::generate()).unwrap().unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].amount, 5);
    }

    #[test]
    fn test_selection_exact_match() {
        let storage = temp_storage();
        for amount in [5, 2, 9] {
            storage.insert_available_coin(amount).unwrap();
        }

        let selected = storage.select_coins(5, TxId::generate()).unwrap().unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].amount, 5);
    }

    #[test]
    fn test_selection_shortfall() {
        let storage = temp_storage();
        storage.insert_available_coin(3).unwrap();

        assert!(storage.select_coins(10, TxId::generate()).unwrap().is_none());
        // nothing was locked by the failed attempt
        assert_eq!(storage.available_total(), 3);
    }

    #[test]
    fn test_rollback_restores_coins() {
        let storage = temp_storage();
        let tx_id = TxId::generate();
        storage.insert_available_coin(10).unwrap();

        storage.select_coins(10, tx_id).unwrap().unwrap();
        storage.create_coin(4, tx_id).unwrap();
        assert_eq!(storage.available_total(), 0);

        storage.rollback_tx(&tx_id).unwrap();
        assert_eq!(storage.available_total(), 10);
        // the unconfirmed output is gone
        assert_eq!(storage.coins().len(), 1);
    }

    #[test]
    fn test_params_roundtrip() {
        let storage = temp_storage();
        let tx_id = TxId::generate();

        storage.set_param(&tx_id, 1, 2, &[1, 2, 3]).unwrap();
        assert_eq!(storage.get_param(&tx_id, 1, 2), Some(vec![1, 2, 3]));
        assert_eq!(storage.get_param(&tx_id, 2, 2), None);
    }

    #[test]
    fn test_delete_tx_clears_params() {
        let storage = temp_storage();
        let tx_id = TxId::generate();

        storage
            .put_tx_record(&TxRecord {
                tx_id,
                tx_type: TxType::AtomicSwap,
                status: TxStatus::Pending,
                failure_reason: None,
                created_at: 0,
            })
            .unwrap();
        storage.set_param(&tx_id, 0, 2, &[9]).unwrap();

        storage.delete_tx(&tx_id).unwrap();
        assert!(storage.get_tx_record(&tx_id).is_none());
        assert_eq!(storage.get_param(&tx_id, 0, 2), None);
    }

    #[test]
    fn test_address_book() {
        let storage = temp_storage();
        let entry = AddressBookEntry {
            wallet_id: WalletId::generate(),
            comment: "swap counterparty".to_string(),
            created_at: 1000,
            expires_at: 1000 + 12 * 3600,
            is_own: false,
        };

        storage.save_address(&entry).unwrap();
        let loaded = storage.get_address(&entry.wallet_id).unwrap();
        assert_eq!(loaded.comment, entry.comment);
        assert_eq!(loaded.expires_at, entry.expires_at);
    }
}
