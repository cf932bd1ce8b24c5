// =============================================================================
// HELIOCOIN v1.6 - Bitcoin Second Side
// =============================================================================
//
// SecondSide implementation for Bitcoin-family chains.
//
// HTLC Script Structure:
// OP_IF
//     OP_HASH160 <hash160(secret)> OP_EQUALVERIFY
//     <recipient_pubkey> OP_CHECKSIG
// OP_ELSE
//     <timeout> OP_CHECKLOCKTIMEVERIFY OP_DROP
//     <refund_pubkey> OP_CHECKSIG
// OP_ENDIF
//
// To claim with secret:    <signature> <preimage> OP_TRUE <redeem_script>
// To refund after timeout: <signature> OP_FALSE <redeem_script>
//
// The lock output is P2SH; claiming it puts the pre-image on chain where
// watch_for_secret can read it back out of the spend script.
//
// Node access goes through the BitcoinBridge trait: funding and signing of
// wallet inputs, broadcasting, confirmation counting and spend lookup stay
// on the client side of that boundary.
//
// =============================================================================

use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Sha256, Digest};
use ripemd::Ripemd160;

use crate::swap::second_side::{
    ChainBSettings, LockTxRef, SecondSide, SecondSideError,
};
use crate::transaction::{PreImage, SecretHash, PRE_IMAGE_SIZE};

// =============================================================================
// Script Opcodes
// =============================================================================

mod opcodes {
    pub const OP_FALSE: u8 = 0x00;
    pub const OP_TRUE: u8 = 0x51;
    pub const OP_IF: u8 = 0x63;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
}

// =============================================================================
// Hash Helpers
// =============================================================================

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(&first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(&sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripe);
    out
}

// =============================================================================
// HTLC Script
// =============================================================================

/// Creates the two-branch swap contract script
pub fn create_htlc_script(
    secret_hash: &SecretHash,
    recipient_pubkey: &[u8; 33],
    refund_pubkey: &[u8; 33],
    timeout: u32,
) -> Vec<u8> {
    use opcodes::*;

    let mut script = Vec::new();

    // claim path with secret
    script.push(OP_IF);
    script.push(OP_HASH160);
    script.push(20);
    script.extend_from_slice(secret_hash.as_bytes());
    script.push(OP_EQUALVERIFY);
    script.push(33);
    script.extend_from_slice(recipient_pubkey);
    script.push(OP_CHECKSIG);

    // refund path after timeout
    script.push(OP_ELSE);
    let timeout_bytes = encode_locktime(timeout);
    script.push(timeout_bytes.len() as u8);
    script.extend_from_slice(&timeout_bytes);
    script.push(OP_CHECKLOCKTIMEVERIFY);
    script.push(OP_DROP);
    script.push(33);
    script.extend_from_slice(refund_pubkey);
    script.push(OP_CHECKSIG);

    script.push(OP_ENDIF);
    script
}

/// Reads the secret image back out of an HTLC redeem script
pub fn htlc_secret_hash(script: &[u8]) -> Option<SecretHash> {
    // fixed layout: OP_IF OP_HASH160 <push 20> image...
    if script.len() < 23 || script[0] != opcodes::OP_IF || script[2] != 20 {
        return None;
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&script[3..23]);
    Some(SecretHash(out))
}

/// Reads the refund timeout back out of an HTLC redeem script
pub fn htlc_timeout(script: &[u8]) -> Option<u32> {
    // claim branch: image push (23) + OP_EQUALVERIFY + pubkey push (34)
    // + OP_CHECKSIG + OP_ELSE, then the timeout push
    let pos = 23 + 1 + 34 + 1 + 1;
    if script.len() <= pos || script[pos - 1] != opcodes::OP_ELSE {
        return None;
    }
    let len = script[pos] as usize;
    if len == 0 || len > 5 || script.len() <= pos + len {
        return None;
    }
    Some(decode_locktime(&script[pos + 1..pos + 1 + len]))
}

/// P2SH scriptSig claiming the HTLC with the secret
pub fn create_claim_script_sig(
    signature: &[u8],
    pre_image: &PreImage,
    redeem_script: &[u8],
) -> Vec<u8> {
    let mut script = Vec::new();
    push_data(&mut script, signature);
    push_data(&mut script, pre_image.as_bytes());
    script.push(opcodes::OP_TRUE);
    push_data(&mut script, redeem_script);
    script
}

/// P2SH scriptSig refunding the HTLC after the timeout
pub fn create_refund_script_sig(signature: &[u8], redeem_script: &[u8]) -> Vec<u8> {
    let mut script = Vec::new();
    push_data(&mut script, signature);
    script.push(opcodes::OP_FALSE);
    push_data(&mut script, redeem_script);
    script
}

/// Extracts the pre-image from a claim scriptSig, checked against the
/// expected image
pub fn extract_pre_image(script_sig: &[u8], expected: &SecretHash) -> Option<PreImage> {
    for push in parse_pushes(script_sig) {
        if push.len() == PRE_IMAGE_SIZE {
            let mut bytes = [0u8; PRE_IMAGE_SIZE];
            bytes.copy_from_slice(&push);
            let candidate = PreImage(bytes);
            if SecretHash::from_pre_image(&candidate) == *expected {
                return Some(candidate);
            }
        }
    }
    None
}

fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    if data.len() < 76 {
        script.push(data.len() as u8);
    } else {
        script.push(0x4c); // OP_PUSHDATA1
        script.push(data.len() as u8);
    }
    script.extend_from_slice(data);
}

pub(crate) fn parse_pushes(script: &[u8]) -> Vec<Vec<u8>> {
    let mut pushes = Vec::new();
    let mut i = 0;
    while i < script.len() {
        let op = script[i];
        match op {
            1..=75 => {
                let len = op as usize;
                if i + 1 + len > script.len() {
                    break;
                }
                pushes.push(script[i + 1..i + 1 + len].to_vec());
                i += 1 + len;
            }
            0x4c => {
                if i + 2 > script.len() {
                    break;
                }
                let len = script[i + 1] as usize;
                if i + 2 + len > script.len() {
                    break;
                }
                pushes.push(script[i + 2..i + 2 + len].to_vec());
                i += 2 + len;
            }
            _ => i += 1,
        }
    }
    pushes
}

/// Decodes a script-number lock time
pub fn decode_locktime(bytes: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i < 4 {
            value |= (byte as u32) << (i * 8);
        }
    }
    value
}

fn encode_locktime(locktime: u32) -> Vec<u8> {
    if locktime == 0 {
        return vec![];
    }
    let mut bytes = locktime.to_le_bytes().to_vec();
    while bytes.len() > 1 && bytes.last() == Some(&0) {
        bytes.pop();
    }
    // keep the number positive in script arithmetic
    if bytes.last().map(|b| b & 0x80 != 0).unwrap_or(false) {
        bytes.push(0x00);
    }
    bytes
}

// =============================================================================
// Script Outputs
// =============================================================================

/// OP_HASH160 <script hash> OP_EQUAL
pub fn p2sh_script_pubkey(redeem_script: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(23);
    script.push(opcodes::OP_HASH160);
    script.push(20);
    script.extend_from_slice(&hash160(redeem_script));
    script.push(opcodes::OP_EQUAL);
    script
}

/// Base58Check P2SH address of a redeem script, for logs and UI display
pub fn p2sh_address(redeem_script: &[u8], version: u8) -> String {
    let mut payload = vec![version];
    payload.extend_from_slice(&hash160(redeem_script));
    let checksum = sha256d(&payload);
    payload.extend_from_slice(&checksum[..4]);
    bs58::encode(payload).into_string()
}

/// Standard pay-to-pubkey-hash output
pub fn p2pkh_script_pubkey(pubkey: &[u8; 33]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(opcodes::OP_DUP);
    script.push(opcodes::OP_HASH160);
    script.push(20);
    script.extend_from_slice(&hash160(pubkey));
    script.push(opcodes::OP_EQUALVERIFY);
    script.push(opcodes::OP_CHECKSIG);
    script
}

// =============================================================================
// Raw Transactions
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BtcTxIn {
    pub prev_txid: [u8; 32],
    pub prev_vout: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BtcTxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BtcTx {
    pub version: u32,
    pub inputs: Vec<BtcTxIn>,
    pub outputs: Vec<BtcTxOut>,
    pub lock_time: u32,
}

impl BtcTx {
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut data, self.inputs.len() as u64);
        for input in &self.inputs {
            data.extend_from_slice(&input.prev_txid);
            data.extend_from_slice(&input.prev_vout.to_le_bytes());
            write_varint(&mut data, input.script_sig.len() as u64);
            data.extend_from_slice(&input.script_sig);
            data.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut data, self.outputs.len() as u64);
        for output in &self.outputs {
            data.extend_from_slice(&output.value.to_le_bytes());
            write_varint(&mut data, output.script_pubkey.len() as u64);
            data.extend_from_slice(&output.script_pubkey);
        }
        data.extend_from_slice(&self.lock_time.to_le_bytes());
        data
    }

    pub fn txid(&self) -> String {
        hex::encode(sha256d(&self.serialize()))
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let mut pos = 0usize;
        let version = u32::from_le_bytes(bytes.get(pos..pos + 4)?.try_into().ok()?);
        pos += 4;

        let (input_count, used) = read_varint(bytes.get(pos..)?)?;
        pos += used;
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let prev_txid: [u8; 32] = bytes.get(pos..pos + 32)?.try_into().ok()?;
            pos += 32;
            let prev_vout = u32::from_le_bytes(bytes.get(pos..pos + 4)?.try_into().ok()?);
            pos += 4;
            let (script_len, used) = read_varint(bytes.get(pos..)?)?;
            pos += used;
            let script_sig = bytes.get(pos..pos + script_len as usize)?.to_vec();
            pos += script_len as usize;
            let sequence = u32::from_le_bytes(bytes.get(pos..pos + 4)?.try_into().ok()?);
            pos += 4;
            inputs.push(BtcTxIn {
                prev_txid,
                prev_vout,
                script_sig,
                sequence,
            });
        }

        let (output_count, used) = read_varint(bytes.get(pos..)?)?;
        pos += used;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let value = u64::from_le_bytes(bytes.get(pos..pos + 8)?.try_into().ok()?);
            pos += 8;
            let (script_len, used) = read_varint(bytes.get(pos..)?)?;
            pos += used;
            let script_pubkey = bytes.get(pos..pos + script_len as usize)?.to_vec();
            pos += script_len as usize;
            outputs.push(BtcTxOut {
                value,
                script_pubkey,
            });
        }

        let lock_time = u32::from_le_bytes(bytes.get(pos..pos + 4)?.try_into().ok()?);
        pos += 4;
        if pos != bytes.len() {
            return None;
        }

        Some(BtcTx {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Legacy sighash: the signed input carries the script code, every
    /// other input an empty script, SIGHASH_ALL appended
    pub fn sighash(&self, input_index: usize, script_code: &[u8]) -> [u8; 32] {
        let mut copy = self.clone();
        for (i, input) in copy.inputs.iter_mut().enumerate() {
            input.script_sig = if i == input_index {
                script_code.to_vec()
            } else {
                Vec::new()
            };
        }
        let mut data = copy.serialize();
        data.extend_from_slice(&1u32.to_le_bytes()); // SIGHASH_ALL
        sha256d(&data)
    }
}

fn read_varint(data: &[u8]) -> Option<(u64, usize)> {
    match *data.first()? {
        n @ 0..=0xfc => Some((n as u64, 1)),
        0xfd => Some((u16::from_le_bytes(data.get(1..3)?.try_into().ok()?) as u64, 3)),
        0xfe => Some((u32::from_le_bytes(data.get(1..5)?.try_into().ok()?) as u64, 5)),
        0xff => Some((u64::from_le_bytes(data.get(1..9)?.try_into().ok()?), 9)),
    }
}

fn write_varint(data: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        data.push(n as u8);
    } else if n <= 0xffff {
        data.push(0xfd);
        data.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        data.push(0xfe);
        data.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        data.push(0xff);
        data.extend_from_slice(&n.to_le_bytes());
    }
}

fn txid_bytes(txid: &str) -> Result<[u8; 32], SecondSideError> {
    let bytes = hex::decode(txid)
        .map_err(|e| SecondSideError::Internal(format!("bad txid hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| SecondSideError::Internal("bad txid length".to_string()))
}

// =============================================================================
// Bridge
// =============================================================================

/// Connection to the Bitcoin-family node and its wallet. Funding and
/// signing of ordinary wallet inputs happen behind this boundary.
pub trait BitcoinBridge {
    fn get_block_count(&mut self) -> Result<u64, SecondSideError>;

    /// Adds wallet inputs and a change output covering the outputs of the
    /// skeleton, signs them, and returns the completed transaction
    fn fund_and_sign(&mut self, tx: BtcTx) -> Result<BtcTx, SecondSideError>;

    fn send_raw_transaction(&mut self, raw: &[u8]) -> Result<String, SecondSideError>;

    fn get_tx_confirmations(&mut self, txid: &str) -> Result<u16, SecondSideError>;

    /// (vout, value) of the first output paying the given script, if the
    /// transaction is known
    fn find_output(
        &mut self,
        txid: &str,
        script_pubkey: &[u8],
    ) -> Result<Option<(u32, u64)>, SecondSideError>;

    /// scriptSig of whatever spent the given output, if it was spent
    fn get_spending_script(
        &mut self,
        txid: &str,
        vout: u32,
    ) -> Result<Option<Vec<u8>>, SecondSideError>;
}

// =============================================================================
// Bitcoin Side
// =============================================================================

pub struct BitcoinSide {
    bridge: Box<dyn BitcoinBridge>,
    settings: ChainBSettings,
    secp: Secp256k1<secp256k1::All>,
    key: SecretKey,
}

impl BitcoinSide {
    pub fn new(bridge: Box<dyn BitcoinBridge>, settings: ChainBSettings) -> Self {
        let key = SecretKey::new(&mut rand::thread_rng());
        Self::with_key(bridge, settings, key)
    }

    pub fn with_key(
        bridge: Box<dyn BitcoinBridge>,
        settings: ChainBSettings,
        key: SecretKey,
    ) -> Self {
        BitcoinSide {
            bridge,
            settings,
            secp: Secp256k1::new(),
            key,
        }
    }

    fn sign_input(&self, tx: &BtcTx, input_index: usize, script_code: &[u8]) -> Vec<u8> {
        let hash = tx.sighash(input_index, script_code);
        let message = Message::from_digest(hash);
        let sig = self.secp.sign_ecdsa(&message, &self.key);
        let mut sig_bytes = sig.serialize_der().to_vec();
        sig_bytes.push(0x01); // SIGHASH_ALL
        sig_bytes
    }

    /// Flat fee charged on the single-input withdraw transactions
    fn withdraw_fee(&self) -> u64 {
        self.settings.fee_rate
    }

    fn build_spend(
        &mut self,
        lock: &LockTxRef,
        lock_time: u32,
        sequence: u32,
    ) -> Result<BtcTx, SecondSideError> {
        let fee = self.withdraw_fee();
        if lock.amount <= fee {
            return Err(SecondSideError::InsufficientFunds);
        }
        let own_pubkey = self.public_key();
        Ok(BtcTx {
            version: 2,
            inputs: vec![BtcTxIn {
                prev_txid: txid_bytes(&lock.txid)?,
                prev_vout: lock.vout,
                script_sig: Vec::new(),
                sequence,
            }],
            outputs: vec![BtcTxOut {
                value: lock.amount - fee,
                script_pubkey: p2pkh_script_pubkey(&own_pubkey),
            }],
            lock_time,
        })
    }
}

impl SecondSide for BitcoinSide {
    fn public_key(&self) -> [u8; 33] {
        PublicKey::from_secret_key(&self.secp, &self.key).serialize()
    }

    fn tip_height(&mut self) -> Result<u64, SecondSideError> {
        self.bridge.get_block_count()
    }

    fn build_lock_tx(
        &mut self,
        amount: u64,
        secret_hash: &SecretHash,
        receiver_pubkey: &[u8; 33],
        sender_pubkey: &[u8; 33],
        lock_time: u64,
    ) -> Result<(Vec<u8>, LockTxRef), SecondSideError> {
        let redeem_script =
            create_htlc_script(secret_hash, receiver_pubkey, sender_pubkey, lock_time as u32);
        let lock_script_pubkey = p2sh_script_pubkey(&redeem_script);
        log::debug!(
            "swap lock contract address: {}",
            p2sh_address(&redeem_script, 0x05)
        );

        let skeleton = BtcTx {
            version: 2,
            inputs: Vec::new(),
            outputs: vec![BtcTxOut {
                value: amount,
                script_pubkey: lock_script_pubkey.clone(),
            }],
            lock_time: 0,
        };
        let funded = self.bridge.fund_and_sign(skeleton)?;

        let vout = funded
            .outputs
            .iter()
            .position(|o| o.script_pubkey == lock_script_pubkey)
            .ok_or_else(|| {
                SecondSideError::Internal("funded transaction lost the lock output".to_string())
            })? as u32;

        let reference = LockTxRef {
            txid: funded.txid(),
            vout,
            amount,
            redeem_script,
        };
        Ok((funded.serialize(), reference))
    }

    fn build_refund_tx(
        &mut self,
        lock: &LockTxRef,
        lock_time: u64,
    ) -> Result<Vec<u8>, SecondSideError> {
        // CLTV needs a non-final sequence and the lock time on the spend
        let mut tx = self.build_spend(lock, lock_time as u32, 0xffff_fffe)?;
        let signature = self.sign_input(&tx, 0, &lock.redeem_script);
        tx.inputs[0].script_sig = create_refund_script_sig(&signature, &lock.redeem_script);
        Ok(tx.serialize())
    }

    fn build_redeem_tx(
        &mut self,
        lock: &LockTxRef,
        pre_image: &PreImage,
    ) -> Result<Vec<u8>, SecondSideError> {
        let mut tx = self.build_spend(lock, 0, 0xffff_ffff)?;
        let signature = self.sign_input(&tx, 0, &lock.redeem_script);
        tx.inputs[0].script_sig =
            create_claim_script_sig(&signature, pre_image, &lock.redeem_script);
        Ok(tx.serialize())
    }

    fn broadcast(&mut self, raw_tx: &[u8]) -> Result<String, SecondSideError> {
        self.bridge.send_raw_transaction(raw_tx)
    }

    fn confirmations(&mut self, txid: &str) -> Result<u16, SecondSideError> {
        self.bridge.get_tx_confirmations(txid)
    }

    fn find_lock_output(
        &mut self,
        txid: &str,
        secret_hash: &SecretHash,
        receiver_pubkey: &[u8; 33],
        sender_pubkey: &[u8; 33],
        lock_time: u64,
    ) -> Result<Option<LockTxRef>, SecondSideError> {
        let redeem_script =
            create_htlc_script(secret_hash, receiver_pubkey, sender_pubkey, lock_time as u32);
        let script_pubkey = p2sh_script_pubkey(&redeem_script);
        match self.bridge.find_output(txid, &script_pubkey)? {
            Some((vout, amount)) => Ok(Some(LockTxRef {
                txid: txid.to_string(),
                vout,
                amount,
                redeem_script,
            })),
            None => Ok(None),
        }
    }

    fn watch_for_secret(&mut self, lock: &LockTxRef) -> Result<Option<PreImage>, SecondSideError> {
        let expected = htlc_secret_hash(&lock.redeem_script).ok_or_else(|| {
            SecondSideError::InvalidScript("lock script has no hash image".to_string())
        })?;
        match self.bridge.get_spending_script(&lock.txid, lock.vout)? {
            Some(script_sig) => Ok(extract_pre_image(&script_sig, &expected)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
