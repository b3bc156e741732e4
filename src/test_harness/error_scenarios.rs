//! Error scenario tests for the connection flow.
//!
//! Organized by the phase the failure hits:
//!
//! - Selection: missing wallets, failing modules, chainId failures
//! - Unlock: vendor specific hints, user rejections
//! - Account: account listing failures
//! - Cache diagnostics: stale wallet caches on a restarted dev chain
//!
//! Test naming convention:
//! - `test_s{N}_{name}` - Selection failure
//! - `test_u{N}_{name}` - Unlock failure
//! - `test_a{N}_{name}` - Account failure
//! - `test_c{N}_{name}` - Cache diagnostic scenario

use std::sync::Arc;

use alloy::primitives::B256;
use serde_json::json;

use super::*;
use crate::ext::{
    codes, has_encountered_blocks_cache_issue, tracked_genesis, NonceCachedStatus, ProviderError,
    ReadinessKey, RpcRequest, SelectOptions, SessionError, StateError, WalletOption, WalletVendor,
    BUILTIN,
};

// ============================================================================
// Selection
// ============================================================================

/// S1: Builtin wallet requested but none is injected
///
/// Expected: NoBuiltinWallet, on the probe and again once known unavailable
#[test_log::test(tokio::test(start_paused = true))]
async fn test_s1_no_builtin_wallet() {
    let scenario = SessionScenario::without_builtin().start().await;

    for _ in 0..2 {
        let err = scenario
            .session
            .select(Some(BUILTIN.into()), SelectOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NoBuiltinWallet);
    }
    let connection = scenario.session.connection();
    assert!(!connection.connecting());
    assert_eq!(connection.error.map(|e| e.message).as_deref(), Some("No Builtin Wallet"));
}

/// S2: Selecting a wallet type nobody offers
#[test_log::test(tokio::test(start_paused = true))]
async fn test_s2_unknown_module() {
    let scenario = SessionScenario::without_builtin().start().await;

    let err = scenario
        .session
        .select(Some("walletconnect".into()), SelectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::ModuleNotFound("walletconnect".into()));
}

/// S3: Module setup throws
///
/// Expected: pending connects reject with the module's error, nothing stays
/// in a loading state
#[test_log::test(tokio::test(start_paused = true))]
async fn test_s3_module_setup_failure() {
    let wallet = FakeWallet::new(1).into_arc();
    let module = Arc::new(FakeModule::new("fake", wallet));
    module.fail_setup(StateError::new("module exploded"));
    let scenario = SessionScenario::without_builtin()
        .with_options(vec![WalletOption::Module(module.clone())])
        .start()
        .await;

    let err = scenario.connect_all().await.unwrap_err();
    assert_eq!(err.message, "module exploded");

    let connection = scenario.session.connection();
    assert!(!connection.is_connected());
    assert!(!connection.connecting());
    assert!(!connection.loading_module());
    assert_eq!(connection.error, Some(err));
    assert_eq!(module.setups(), 1);
}

/// S4: eth_chainId never answers
///
/// Expected: the access request fallback runs, then selection fails with
/// ChainIdUnavailable
#[test_log::test(tokio::test(start_paused = true))]
async fn test_s4_chain_id_timeout() {
    let wallet = FakeWallet::new(1).into_arc();
    wallet.hang("eth_chainId");
    let scenario = SessionScenario::builtin(wallet.clone()).start().await;

    let err = scenario
        .session
        .select(Some(BUILTIN.into()), SelectOptions::default())
        .await
        .unwrap_err();
    let SessionError::ChainIdUnavailable(cause) = err else {
        panic!("expected ChainIdUnavailable, got {err:?}");
    };
    assert!(matches!(cause, ProviderError::Timeout(_)));
    assert_eq!(wallet.calls("eth_requestAccounts"), 1);
    assert!(!scenario.session.connection().is_connected());
}

/// S5: eth_chainId refused until access is granted
///
/// Expected: eth_requestAccounts is sent, the retry succeeds
#[test_log::test(tokio::test(start_paused = true))]
async fn test_s5_chain_id_unauthorized_falls_back_on_access_request() {
    let wallet = FakeWallet::new(1).into_arc();
    wallet.fail_next(
        "eth_chainId",
        ProviderError::rpc(codes::UNAUTHORIZED, "The requested method has not been authorized"),
    );
    let scenario = SessionScenario::builtin(wallet.clone()).start().await;

    assert!(scenario.connect_all().await.unwrap());
    assert_eq!(wallet.calls("eth_requestAccounts"), 1);
    assert_eq!(scenario.session.network().chain_id(), Some(1));
}

// ============================================================================
// Unlock
// ============================================================================

/// U1: Metamask already has an access request open
///
/// Expected: the unlock hint is shown, the connect stays pending, and the
/// user unlocking from the extension completes it
#[test_log::test(tokio::test(start_paused = true))]
async fn test_u1_metamask_request_already_pending() {
    let wallet = FakeWallet::new(1)
        .locked()
        .with_vendor(WalletVendor::Metamask)
        .into_arc();
    wallet.fail_next(
        "eth_requestAccounts",
        ProviderError::rpc(
            codes::ALREADY_PROCESSING,
            "Already processing eth_requestAccounts. Please wait.",
        ),
    );
    let scenario = SessionScenario::builtin(wallet.clone()).start().await;

    let session = scenario.session.clone();
    let connecting = tokio::spawn(async move {
        session.connect(ReadinessKey::ConnectionNetworkAccount).await
    });

    let mut connection = scenario.session.subscribe_connection();
    let shown = wait_for(&mut connection, |c| c.error.is_some()).await.unwrap();
    assert!(shown.error.unwrap().message.contains("Metamask add-on's icon"));
    assert!(scenario.session.account().unlocking());
    settle().await;
    assert!(!connecting.is_finished());

    wallet.unlock();
    assert!(connecting.await.unwrap().unwrap());
    assert_eq!(scenario.session.account().address(), Some(ALICE));
}

/// U2: Brave rejects the access request while locked
///
/// Expected: the hint is shown and the connect settles false
#[test_log::test(tokio::test(start_paused = true))]
async fn test_u2_brave_locked_rejection() {
    let wallet = FakeWallet::new(1)
        .locked()
        .with_vendor(WalletVendor::Brave)
        .into_arc();
    wallet.fail_next(
        "eth_requestAccounts",
        ProviderError::rpc(codes::USER_REJECTED, "The user rejected the request."),
    );
    let scenario = SessionScenario::builtin(wallet.clone()).start().await;

    assert!(!scenario.connect_all().await.unwrap());
    let error = scenario.session.connection().error.expect("unlock hint");
    assert!(error.message.contains("Brave wallet's icon"));
    assert!(!scenario.session.account().unlocking());
    assert!(scenario.session.account().locked());
}

/// U3: Generic user rejection of the access request
///
/// Expected: connect settles false without an error
#[test_log::test(tokio::test(start_paused = true))]
async fn test_u3_user_rejects_unlock() {
    let wallet = FakeWallet::new(1).locked().into_arc();
    wallet.fail_next(
        "eth_requestAccounts",
        ProviderError::rpc(codes::USER_REJECTED, "User denied account authorization"),
    );
    let scenario = SessionScenario::builtin(wallet.clone()).start().await;

    assert!(!scenario.connect_all().await.unwrap());
    assert!(scenario.session.connection().error.is_none());
    assert!(scenario.session.account().locked());
    assert!(!scenario.session.account().unlocking());

    wallet.fail_next(
        "eth_requestAccounts",
        ProviderError::rpc(codes::USER_REJECTED, "User denied account authorization"),
    );
    let executed = scenario
        .session
        .execute(|context| async move { context.address })
        .await
        .unwrap();
    assert_eq!(executed, None);
}

/// U4: unlock on an unlocked account
#[test_log::test(tokio::test(start_paused = true))]
async fn test_u4_unlock_when_not_locked() {
    let wallet = FakeWallet::new(1).into_arc();
    let scenario = SessionScenario::builtin(wallet).start().await;
    assert!(scenario.connect_all().await.unwrap());

    assert_eq!(scenario.session.unlock().await, Err(SessionError::NotLocked));
    assert!(scenario.session.account().is_connected());
}

/// U5: the user gives up waiting on the unlock prompt
#[test_log::test(tokio::test(start_paused = true))]
async fn test_u5_cancel_unlock() {
    let wallet = FakeWallet::new(1).locked().into_arc();
    let scenario = SessionScenario::builtin(wallet).start().await;

    let session = scenario.session.clone();
    let connecting = tokio::spawn(async move {
        session.connect(ReadinessKey::ConnectionNetworkAccount).await
    });
    scenario.wait_for_locked().await.unwrap();

    scenario.session.cancel_unlock();
    assert!(!connecting.await.unwrap().unwrap());
    assert!(!scenario.session.account().unlocking());
}

// ============================================================================
// Account
// ============================================================================

/// A1: eth_accounts fails with a non-benign error
///
/// Expected: account tiers reject, the connection error names the failure
#[test_log::test(tokio::test(start_paused = true))]
async fn test_a1_account_fetch_failure() {
    let wallet = FakeWallet::new(1).into_arc();
    wallet.fail_next("eth_accounts", ProviderError::rpc(codes::INTERNAL, "internal error"));
    let scenario = SessionScenario::builtin(wallet).start().await;

    let err = scenario.connect_all().await.unwrap_err();
    assert_eq!(err.message, "failed to fetch accounts");
    assert!(err.cause.is_some());
    assert_eq!(scenario.session.connection().error, Some(err));
    assert!(scenario.session.connection().is_connected());
}

/// A2: eth_accounts refused before access is granted counts as locked
#[test_log::test(tokio::test(start_paused = true))]
async fn test_a2_unauthorized_accounts_mean_locked() {
    let wallet = FakeWallet::new(1).into_arc();
    wallet.fail_next(
        "eth_accounts",
        ProviderError::rpc(codes::UNAUTHORIZED, "The requested account has not been authorized"),
    );
    let scenario = SessionScenario::builtin(wallet).start().await;

    scenario
        .session
        .select(Some(BUILTIN.into()), SelectOptions::default().with_auto_unlock(false))
        .await
        .unwrap();
    assert!(scenario.session.account().locked());
    assert!(scenario.session.connection().error.is_none());
}

// ============================================================================
// Cache diagnostics
// ============================================================================

/// C1: a wrapped call fails with a stale block cache error
///
/// Expected: the flag is set and persisted, then clears once the wallet
/// catches up with the node
#[test_log::test(tokio::test(start_paused = true))]
async fn test_c1_stale_cache_error_from_call() {
    let wallet = FakeWallet::new(1).into_arc();
    let node = Arc::new(FakeReferenceNode::new());
    node.set_block_number(200);
    let scenario = SessionScenario::builtin(wallet.clone())
        .with_dev_node(1, node, false)
        .start()
        .await;
    wallet.set_block_number(199);
    assert!(scenario.connect_all().await.unwrap());
    assert_eq!(scenario.session.network().diagnostics.blocks_cached, Some(false));

    wallet.set_block_number(100);
    wallet.fail_next(
        "eth_call",
        ProviderError::rpc(
            codes::INTERNAL,
            "BlockOutOfRangeError: block height is 100 but requested was 150",
        ),
    );
    let provider = scenario.session.provider().unwrap();
    let err = provider
        .request(RpcRequest::new("eth_call", vec![json!({ "to": BOB }), json!("0x96")]))
        .await
        .unwrap_err();
    assert!(err.kind().is_stale_cache());

    let diagnostics = scenario.session.network().diagnostics;
    assert_eq!(diagnostics.blocks_cached, Some(true));
    assert_eq!(diagnostics.has_encountered_blocks_cache_issue, Some(true));
    assert!(has_encountered_blocks_cache_issue(scenario.store.as_ref(), 1));

    wallet.set_block_number(200);
    let mut network = scenario.session.subscribe_network();
    wait_for(&mut network, |n| n.diagnostics.blocks_cached == Some(false))
        .await
        .unwrap();
    assert_eq!(
        scenario.session.network().diagnostics.has_encountered_blocks_cache_issue,
        Some(true)
    );
}

/// C2: the wallet reports a genesis from before the dev chain restarted
///
/// Expected: mismatch flagged, then acknowledged once the wallet agrees
#[test_log::test(tokio::test(start_paused = true))]
async fn test_c2_genesis_mismatch_self_heals() {
    let wallet = FakeWallet::new(1).with_genesis(B256::repeat_byte(0x99)).into_arc();
    let node = Arc::new(FakeReferenceNode::new());
    let scenario = SessionScenario::builtin(wallet.clone())
        .with_dev_node(1, node, false)
        .start()
        .await;
    assert!(scenario.connect_all().await.unwrap());

    let diagnostics = scenario.session.network().diagnostics;
    assert_eq!(diagnostics.genesis_not_matching, Some(true));
    assert_eq!(diagnostics.genesis_hash, Some(GENESIS));
    assert!(diagnostics.has_issue());

    wallet.set_genesis(GENESIS);
    let mut network = scenario.session.subscribe_network();
    let healed = wait_for(&mut network, |n| n.diagnostics.genesis_not_matching == Some(false))
        .await
        .unwrap();
    assert_eq!(healed.diagnostics.genesis_changed, Some(false));
    assert_eq!(tracked_genesis(scenario.store.as_ref(), 1), Some(GENESIS));
}

/// C3: a new genesis is flagged as changed until acknowledged
#[test_log::test(tokio::test(start_paused = true))]
async fn test_c3_genesis_change_acknowledged() {
    let wallet = FakeWallet::new(1).into_arc();
    let node = Arc::new(FakeReferenceNode::new());
    let scenario = SessionScenario::builtin(wallet.clone())
        .with_dev_node(1, node, false)
        .start()
        .await;
    crate::ext::record_new_genesis(scenario.store.as_ref(), 1, B256::repeat_byte(0x01));
    assert!(scenario.connect_all().await.unwrap());
    assert_eq!(scenario.session.network().diagnostics.genesis_changed, Some(true));

    scenario.session.acknowledge_new_genesis();
    assert_eq!(scenario.session.network().diagnostics.genesis_changed, Some(false));
    assert_eq!(tracked_genesis(scenario.store.as_ref(), 1), Some(GENESIS));
}

/// C4: the wallet lags the dev node by more than the tolerance
#[test_log::test(tokio::test(start_paused = true))]
async fn test_c4_blocks_cached_self_heals() {
    let wallet = FakeWallet::new(1).with_block_number(100).into_arc();
    let node = Arc::new(FakeReferenceNode::new());
    node.set_block_number(150);
    let scenario = SessionScenario::builtin(wallet.clone())
        .with_dev_node(1, node, false)
        .start()
        .await;
    assert!(scenario.connect_all().await.unwrap());

    let diagnostics = scenario.session.network().diagnostics;
    assert_eq!(diagnostics.blocks_cached, Some(true));
    assert_eq!(diagnostics.has_encountered_blocks_cache_issue, Some(true));

    wallet.set_block_number(148);
    let mut network = scenario.session.subscribe_network();
    wait_for(&mut network, |n| n.diagnostics.blocks_cached == Some(false))
        .await
        .unwrap();
}

/// C5: the wallet's nonce for the account disagrees with the node
#[test_log::test(tokio::test(start_paused = true))]
async fn test_c5_nonce_cached_self_heals() {
    let wallet = FakeWallet::new(1).with_nonce(0).into_arc();
    let node = Arc::new(FakeReferenceNode::new());
    node.set_nonce(3);
    let scenario = SessionScenario::builtin(wallet.clone())
        .with_dev_node(1, node, true)
        .start()
        .await;
    assert!(scenario.connect_all().await.unwrap());
    assert_eq!(
        scenario.session.network().diagnostics.nonce_cached,
        Some(NonceCachedStatus::BelowNode)
    );

    wallet.set_nonce(3);
    let mut network = scenario.session.subscribe_network();
    wait_for(&mut network, |n| n.diagnostics.nonce_cached.is_none())
        .await
        .unwrap();
    assert_eq!(tracked_genesis(scenario.store.as_ref(), 1), Some(GENESIS));
}

/// C6: diagnostics only run for the configured dev chain
#[test_log::test(tokio::test(start_paused = true))]
async fn test_c6_other_chains_skip_diagnostics() {
    let wallet = FakeWallet::new(5).with_genesis(B256::repeat_byte(0x99)).into_arc();
    let node = Arc::new(FakeReferenceNode::new());
    let scenario = SessionScenario::builtin(wallet.clone())
        .with_dev_node(1, node, true)
        .start()
        .await;
    assert!(scenario.connect_all().await.unwrap());

    let diagnostics = scenario.session.network().diagnostics;
    assert!(!diagnostics.has_issue());
    assert_eq!(diagnostics.genesis_not_matching, None);
    assert_eq!(diagnostics.has_encountered_blocks_cache_issue, Some(false));
    assert_eq!(wallet.calls("eth_getTransactionCount"), 0);
}
