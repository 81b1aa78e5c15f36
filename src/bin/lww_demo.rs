//! Two clients editing one key concurrently
//!
//! Run with: RUST_LOG=debug cargo run --bin lww_demo

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use otsync::node::wire::{CborCodec, LoopbackTransport, WireNode};
use otsync::systems::{DictDiff, DictState, DictSystem};
use otsync::{
    InMemoryRepository, OtAlgorithms, RepositoryNode, StateManager, SyncConfig, SyncNode,
};

type Server = RepositoryNode<InMemoryRepository<DictDiff>, DictSystem>;

fn value<N>(manager: &StateManager<N, DictSystem, DictState>) -> String
where
    N: SyncNode<DictDiff> + ?Sized + 'static,
{
    manager.with_state(|state| state.get("x").unwrap_or("<unset>").to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SyncConfig::default();
    let repository = Arc::new(InMemoryRepository::with_root().context("seeding repository")?);
    let system = Arc::new(DictSystem);
    let server: Arc<Server> = Arc::new(RepositoryNode::new(OtAlgorithms::new(
        Arc::clone(&repository),
        Arc::clone(&system),
        config.merge_retry.clone(),
    )));

    // Alice talks to the server directly, Bob through the CBOR wire codec
    let alice = StateManager::new(
        Arc::clone(&server),
        Arc::clone(&system),
        DictState::default(),
        config.sync_retry.clone(),
    );
    let bob_node = WireNode::new(
        LoopbackTransport::<Server, _, DictDiff>::new(Arc::clone(&server), CborCodec),
        CborCodec,
    );
    let bob = StateManager::new(
        Arc::new(bob_node),
        system,
        DictState::default(),
        config.sync_retry.clone(),
    );

    alice.checkout().await?;
    bob.checkout().await?;

    println!("\n📝 Alice writes x = 1");
    alice.add(DictDiff::insert("x", "1"))?;
    alice.sync().await?;
    bob.sync().await?;
    println!("   alice: {}  bob: {}", value(&alice), value(&bob));

    println!("\n⚡ Concurrent edits: alice 1 → 2, bob 1 → 3");
    alice.add(DictDiff::set("x", Some("1"), Some("2")))?;
    bob.add(DictDiff::set("x", Some("1"), Some("3")))?;
    println!("   alice: {}  bob: {}", value(&alice), value(&bob));

    alice.sync().await?;
    bob.sync().await?;
    alice.sync().await?;

    let (a, b) = (value(&alice), value(&bob));
    println!("\n✅ Converged: alice: {}  bob: {}", a, b);
    println!("   commits stored: {}", repository.commit_count().await);
    if a != b {
        bail!("clients diverged: {} vs {}", a, b);
    }
    Ok(())
}
