// SPDX-License-Identifier: Apache-2.0

mod common;

use bitcoin::bip32::{ChildNumber, Fingerprint};
use bitcoin::hashes::Hash;
use bitcoin::{Amount, EcdsaSighashType, Network, ScriptBuf, TxOut};
use ledger_btc_app::{
    AddressFormat, BtcAppError, GetPublicKeyParams, HashInput, HashSession, InputReference,
    StartMode,
};

use common::*;

#[tokio::test]
async fn public_key_request_frame() {
    let mock = MockLedger::new();
    let app = app(&mock);
    let p = path("m/84'/0'/0'/0/0");

    let params = GetPublicKeyParams::new(p.clone())
        .with_display()
        .with_format(AddressFormat::Bech32);
    let info = app.get_public_key(params).await.unwrap();

    let frames = mock.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!((frames[0].cla, frames[0].ins), (0xE0, 0x40));
    assert_eq!((frames[0].p1, frames[0].p2), (0x01, 0x02));
    assert_eq!(frames[0].data, p.encode());

    assert_eq!(info.public_key, key_for(&p));
    assert_eq!(info.raw_public_key.len(), 65);
    assert_eq!(info.address, "mock");
}

#[tokio::test]
async fn extended_public_key_uses_parent_fingerprint() {
    let mock = MockLedger::new();
    let app = app(&mock);
    let p = path("m/84'/0'/0'");

    let xpub = app
        .get_extended_public_key(&p, Network::Bitcoin)
        .await
        .unwrap();

    let parent = key_for(&path("m/84'/0'"));
    let hash = parent.pubkey_hash().to_byte_array();
    assert_eq!(xpub.parent_fingerprint, Fingerprint::from([hash[0], hash[1], hash[2], hash[3]]));
    assert_eq!(xpub.depth, 3);
    assert_eq!(xpub.child_number, ChildNumber::from_hardened_idx(0).unwrap());
    assert_eq!(xpub.public_key, key_for(&p).0);
    assert_eq!(mock.count(INS_GET_PUBLIC_KEY), 2);
    assert!(xpub.to_string().starts_with("xpub"));
}

#[tokio::test]
async fn extended_public_key_at_depth_one() {
    let mock = MockLedger::new();
    let app = app(&mock);

    let xpub = app
        .get_extended_public_key(&path("m/44'"), Network::Testnet)
        .await
        .unwrap();
    assert_eq!(xpub.parent_fingerprint, Fingerprint::from([0u8; 4]));
    assert_eq!(mock.count(INS_GET_PUBLIC_KEY), 1);
    assert!(xpub.to_string().starts_with("tpub"));
}

#[tokio::test]
async fn firmware_and_app_info() {
    let mock = MockLedger::new();
    let app = app(&mock);

    let version = app.get_firmware_version().await.unwrap();
    assert_eq!(version.to_string(), "2.1.0");

    let info = app.get_app_info().await.unwrap();
    assert_eq!(info.app_name, "Bitcoin");
    assert_eq!(info.app_version, "2.1.0");
    assert!(info.flag_pin_validated);
}

#[tokio::test]
async fn trusted_input_streams_previous_transaction() {
    let mock = MockLedger::new();
    let app = app(&mock);
    let prev = funding_tx(ScriptBuf::from_bytes(vec![0x6a, 0x01, 7]), 3, 60);

    let token = app.get_trusted_input(&prev, 2).await.unwrap();
    assert_eq!(token.as_bytes().len(), 56);

    let sequences = mock.sequences(INS_TRUSTED_INPUT);
    assert_eq!(sequences.len(), 1);
    let first = &sequences[0][0];
    assert_eq!(first.data[..4], 2u32.to_be_bytes());
    assert!(sequences[0].len() > 3);

    let err = app.get_trusted_input(&prev, 9).await.unwrap_err();
    assert!(matches!(err, BtcAppError::MissingPreviousOutput(_)));
}

#[tokio::test]
async fn low_level_session_commands() {
    let mock = MockLedger::new();
    let app = app(&mock);
    let prev = funding_tx(ScriptBuf::from_bytes(vec![0x6a, 0x01, 8]), 0, 61);
    let op = outpoint(&prev, 0);
    let a = path("m/84'/0'/0'/0/0");
    let b = path("m/84'/0'/0'/0/1");

    let inputs = [HashInput {
        reference: InputReference::Witness(op, 50_000),
        script: ScriptBuf::new_p2pkh(&key_for(&a).pubkey_hash()),
        sequence: 0xFFFF_FFFD,
    }];
    let outputs = [TxOut {
        value: Amount::from_sat(40_000),
        script_pubkey: ScriptBuf::new_p2wpkh(&key_for(&b).wpubkey_hash()),
    }];

    // Outputs cannot be committed before the inputs
    assert!(matches!(
        app.hash_output_finalize(&outputs).await,
        Err(BtcAppError::SessionExpired)
    ));
    // Continue needs a legacy session that already signed
    assert!(matches!(
        app.hash_transaction_start(2, &inputs, StartMode::Continue).await,
        Err(BtcAppError::SessionExpired)
    ));
    assert!(mock.frames().is_empty());

    app.hash_transaction_start(2, &inputs, StartMode::NewWitness)
        .await
        .unwrap();
    app.hash_output_finalize(&outputs).await.unwrap();

    let first = app.hash_sign(&a, 0, EcdsaSighashType::All).await.unwrap();
    assert_eq!(first.to_stack_item(), signature_for(&a));
    assert_eq!(first.der[0], 0x30);

    // Witness sessions sign repeatedly without restarting
    let second = app.hash_sign(&b, 0, EcdsaSighashType::All).await.unwrap();
    assert_eq!(second.to_stack_item(), signature_for(&b));
    assert_eq!(
        app.session_state().await,
        HashSession::Signed { witness: true }
    );

    let finalize = mock
        .frames()
        .into_iter()
        .filter(|f| f.ins == INS_FINALIZE)
        .collect::<Vec<_>>();
    assert_eq!(finalize.last().unwrap().p1, 0x80);
    assert!(finalize[..finalize.len() - 1].iter().all(|f| f.p1 == 0x00));
}

#[tokio::test]
async fn open_session_refuses_a_new_start() {
    let mock = MockLedger::new();
    let app = app(&mock);
    let prev = funding_tx(ScriptBuf::from_bytes(vec![0x6a, 0x01, 9]), 0, 62);
    let a = path("m/44'/0'/0'/0/0");

    let inputs = [HashInput {
        reference: InputReference::Untrusted(outpoint(&prev, 0)),
        script: ScriptBuf::new_p2pkh(&key_for(&a).pubkey_hash()),
        sequence: 0xFFFF_FFFF,
    }];
    let outputs = [TxOut {
        value: Amount::from_sat(40_000),
        script_pubkey: ScriptBuf::new_p2pkh(&key_for(&a).pubkey_hash()),
    }];

    app.hash_transaction_start(1, &inputs, StartMode::NewLegacy)
        .await
        .unwrap();
    app.hash_output_finalize(&outputs).await.unwrap();
    let sent = mock.frames().len();

    assert!(matches!(
        app.hash_transaction_start(2, &inputs, StartMode::NewWitness).await,
        Err(BtcAppError::SessionConflict)
    ));
    assert_eq!(mock.frames().len(), sent);
    assert_eq!(
        app.session_state().await,
        HashSession::OutputsFinalized { witness: false }
    );

    app.end_hash_session().await;
    app.hash_transaction_start(1, &inputs, StartMode::NewLegacy)
        .await
        .unwrap();
    assert_eq!(
        app.session_state().await,
        HashSession::Started { witness: false }
    );
}
