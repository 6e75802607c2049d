// SPDX-License-Identifier: Apache-2.0

//! In-memory device emulating the Bitcoin app answers

#![allow(dead_code)]

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::script::Instruction;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, CompressedPublicKey, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};
use ledger_btc_app::{BipPath, BitcoinApp};
use ledger_device_base::LedgerDevice;
use ledger_transport::{async_trait, APDUAnswer, APDUCommand, Exchange};

pub const INS_GET_PUBLIC_KEY: u8 = 0x40;
pub const INS_TRUSTED_INPUT: u8 = 0x42;
pub const INS_HASH_START: u8 = 0x44;
pub const INS_HASH_SIGN: u8 = 0x48;
pub const INS_FINALIZE: u8 = 0x4A;

/// One recorded command frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct MockLedger {
    frames: Mutex<Vec<Frame>>,
    failures: Mutex<HashMap<u8, u16>>,
    trusted_inputs: Mutex<u8>,
    delay: Option<Duration>,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    /// Answer every frame of `ins` with `sw`
    pub fn fail(&self, ins: u8, sw: u16) {
        self.failures.lock().unwrap().insert(ins, sw);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn clear_frames(&self) {
        self.frames.lock().unwrap().clear();
    }

    pub fn instructions(&self) -> Vec<u8> {
        self.frames().iter().map(|f| f.ins).collect()
    }

    pub fn count(&self, ins: u8) -> usize {
        self.frames().iter().filter(|f| f.ins == ins).count()
    }

    /// Streams of `ins`, each starting with a P1 0x00 frame
    pub fn sequences(&self, ins: u8) -> Vec<Vec<Frame>> {
        let mut sequences: Vec<Vec<Frame>> = Vec::new();
        for frame in self.frames().into_iter().filter(|f| f.ins == ins) {
            match sequences.last_mut() {
                Some(current) if frame.p1 != 0x00 => current.push(frame),
                _ => sequences.push(vec![frame]),
            }
        }
        sequences
    }

    /// Number of completed output commitments
    pub fn finalize_count(&self) -> usize {
        self.frames()
            .iter()
            .filter(|f| f.ins == INS_FINALIZE && f.p1 == 0x80)
            .count()
    }

    fn answer(&self, frame: &Frame) -> Vec<u8> {
        if let Some(sw) = self.failures.lock().unwrap().get(&frame.ins) {
            return sw.to_be_bytes().to_vec();
        }

        let mut data = match (frame.cla, frame.ins) {
            (0xE0, INS_GET_PUBLIC_KEY) => {
                let path = path_bytes(&frame.data);
                let key = secret_for(path);
                let secp = Secp256k1::new();
                let pk = PublicKey::from_secret_key(&secp, &key);

                let mut out = vec![65];
                out.extend_from_slice(&pk.serialize_uncompressed());
                out.push(4);
                out.extend_from_slice(b"mock");
                out.extend_from_slice(&sha256::Hash::hash(b"chain").to_byte_array());
                out
            }
            (0xE0, INS_TRUSTED_INPUT) => {
                let mut counter = self.trusted_inputs.lock().unwrap();
                if frame.p1 == 0x00 {
                    *counter += 1;
                }
                let mut token = vec![0x32, *counter];
                token.resize(56, 0xEE);
                token
            }
            (0xE0, INS_HASH_START) => vec![],
            (0xE0, INS_FINALIZE) if frame.p1 == 0x80 => vec![0x00, 0x00],
            (0xE0, INS_FINALIZE) => vec![],
            (0xE0, INS_HASH_SIGN) => {
                let mut der = device_signature(path_bytes(&frame.data));
                der[0] = 0x31;
                der
            }
            (0xE0, 0xC4) => vec![0x1B, 0x30, 2, 1, 0],
            (0xB0, 0x01) => {
                let mut out = vec![0x01, 7];
                out.extend_from_slice(b"Bitcoin");
                out.push(5);
                out.extend_from_slice(b"2.1.0");
                out.extend_from_slice(&[1, 0x84]);
                out
            }
            _ => return vec![0x6D, 0x00],
        };
        data.extend_from_slice(&[0x90, 0x00]);
        data
    }
}

#[async_trait]
impl Exchange for MockLedger {
    type Error = std::io::Error;
    type AnswerType = Vec<u8>;

    async fn exchange<I>(
        &self,
        command: &APDUCommand<I>,
    ) -> Result<APDUAnswer<Self::AnswerType>, Self::Error>
    where
        I: Deref<Target = [u8]> + Send + Sync,
    {
        // Give other tasks a chance to run between frames
        tokio::task::yield_now().await;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let frame = Frame {
            cla: command.cla,
            ins: command.ins,
            p1: command.p1,
            p2: command.p2,
            data: command.data.to_vec(),
        };
        let answer = self.answer(&frame);
        self.frames.lock().unwrap().push(frame);

        APDUAnswer::from_answer(answer)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }
}

/// Encoded path at the start of a payload
fn path_bytes(data: &[u8]) -> &[u8] {
    let len = 1 + 4 * data[0] as usize;
    &data[..len]
}

fn secret_for(encoded_path: &[u8]) -> SecretKey {
    let seed = sha256::Hash::hash(encoded_path).to_byte_array();
    SecretKey::from_slice(&seed).unwrap()
}

/// DER-shaped signature the mock returns for a path (parity flag cleared)
fn device_signature(encoded_path: &[u8]) -> Vec<u8> {
    let r = sha256::Hash::hash(encoded_path).to_byte_array();
    let mut der = vec![0x30, 0x44, 0x02, 0x20];
    der.extend_from_slice(&r);
    der.extend_from_slice(&[0x02, 0x20]);
    der.extend_from_slice(&[0x01; 32]);
    der
}

/// Public key the mock derives for `path`
pub fn key_for(path: &BipPath) -> CompressedPublicKey {
    let secp = Secp256k1::new();
    CompressedPublicKey(PublicKey::from_secret_key(&secp, &secret_for(&path.encode())))
}

/// Stack item expected for a signature with `path` and SIGHASH_ALL
pub fn signature_for(path: &BipPath) -> Vec<u8> {
    let mut item = device_signature(&path.encode());
    item.push(0x01);
    item
}

pub fn path(text: &str) -> BipPath {
    text.parse().unwrap()
}

pub fn app(mock: &Arc<MockLedger>) -> BitcoinApp<Arc<MockLedger>> {
    let _ = env_logger::builder().is_test(true).try_init();
    BitcoinApp::new(LedgerDevice::new(mock.clone()))
}

/// A funding transaction paying `value` to `script_pubkey` at output `vout`
pub fn funding_tx(script_pubkey: ScriptBuf, vout: u32, seed: u8) -> Transaction {
    let mut output: Vec<TxOut> = (0..vout)
        .map(|_| TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::from_bytes(vec![0x6a, 0x01, seed]),
        })
        .collect();
    output.push(TxOut {
        value: Amount::from_sat(100_000 + seed as u64),
        script_pubkey,
    });

    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(vec![seed; 30]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output,
    }
}

/// Output `vout` of `tx`
pub fn outpoint(tx: &Transaction, vout: u32) -> OutPoint {
    OutPoint::new(tx.compute_txid(), vout)
}

/// A transaction spending `outpoints` to a single output
pub fn spending_tx(outpoints: &[OutPoint], version: i32, lock_time: u32) -> Transaction {
    Transaction {
        version: Version(version),
        lock_time: LockTime::from_consensus(lock_time),
        input: outpoints
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: vec![TxOut {
            value: Amount::from_sat(90_000),
            script_pubkey: ScriptBuf::new_p2pkh(&key_for(&path("m/44'/0'/0'/1/0")).pubkey_hash()),
        }],
    }
}

/// Lengths of the scripts streamed in one hash start sequence, in input order
pub fn streamed_script_lengths(sequence: &[Frame]) -> Vec<usize> {
    let count = sequence[0].data[4] as usize;
    let mut lengths = Vec::with_capacity(count);
    let mut idx = 1;
    for _ in 0..count {
        let len = *sequence[idx].data.last().unwrap() as usize;
        lengths.push(len);
        idx += 1 + len.div_ceil(50).max(1);
    }
    assert_eq!(idx, sequence.len(), "unexpected trailing frames");
    lengths
}

/// Data pushes of an unlocking script
pub fn pushes(script: &Script) -> Vec<Vec<u8>> {
    script
        .instructions()
        .map(|item| match item.unwrap() {
            Instruction::PushBytes(bytes) => bytes.as_bytes().to_vec(),
            Instruction::Op(op) => panic!("unexpected opcode {op}"),
        })
        .collect()
}

/// Lock time carried by a hash sign frame
pub fn signed_lock_time(frame: &Frame) -> u32 {
    let offset = 1 + 4 * frame.data[0] as usize + 1;
    u32::from_be_bytes(frame.data[offset..offset + 4].try_into().unwrap())
}

/// Descriptor tags (0x00 untrusted, 0x01 trusted, 0x02 witness) of one hash start sequence
pub fn streamed_input_tags(sequence: &[Frame]) -> Vec<u8> {
    let count = sequence[0].data[4] as usize;
    let mut tags = Vec::with_capacity(count);
    let mut idx = 1;
    for _ in 0..count {
        tags.push(sequence[idx].data[0]);
        let len = *sequence[idx].data.last().unwrap() as usize;
        idx += 1 + len.div_ceil(50).max(1);
    }
    tags
}
