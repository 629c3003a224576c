//! Demo object graph served by `objcall-peer serve`.

use objcall_core::transport::Connection;
use objcall_core::graph::ObjectBuilder;
use objcall_core::{Instance, ObjectNode, Revivable, RevivalRegistry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Longest sleep the demo graph agrees to.
const MAX_SLEEP_MS: u64 = 60_000;

const SUITS: [&str; 4] = ["clubs", "diamonds", "hearts", "spades"];

/// A playing card. `name` is derived and never sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub rank: u8,
    pub suit: String,
    #[serde(skip)]
    pub name: String,
}

impl Card {
    pub fn new(rank: u8, suit: impl Into<String>) -> anyhow::Result<Self> {
        let suit = suit.into();
        if !(1..=13).contains(&rank) {
            anyhow::bail!("rank must be between 1 and 13, got {}", rank);
        }
        if !SUITS.contains(&suit.as_str()) {
            anyhow::bail!("unknown suit {:?}", suit);
        }
        let mut card = Card {
            rank,
            suit,
            name: String::new(),
        };
        card.on_revive();
        Ok(card)
    }
}

impl Revivable for Card {
    const TYPE_NAME: &'static str = "Card";

    fn on_revive(&mut self) {
        let rank = match self.rank {
            1 => "Ace".to_string(),
            11 => "Jack".to_string(),
            12 => "Queen".to_string(),
            13 => "King".to_string(),
            n => n.to_string(),
        };
        self.name = format!("{} of {}", rank, self.suit);
    }
}

/// Registry knowing every revivable type of the demo graph.
pub fn registry() -> Arc<RevivalRegistry> {
    let registry = Arc::new(RevivalRegistry::new());
    registry.register::<Card>();
    registry
}

fn cards() -> ObjectBuilder {
    ObjectNode::builder()
        .func("draw", |ctx, p| {
            let rank: u8 = p.arg(0)?;
            let suit: String = p.opt_arg(1)?.unwrap_or_else(|| "spades".to_string());
            Ok(ctx.instance(Card::new(rank, suit)?))
        })
        .func("describe", |_, p| {
            let card: Instance<Card> = p.arg(0)?;
            Ok(card.name.clone())
        })
}

/// Build the demo graph.
pub fn graph() -> Arc<ObjectNode> {
    ObjectNode::builder()
        .object(
            "math",
            ObjectNode::builder()
                .func("add", |_, p| Ok(p.arg::<f64>(0)? + p.arg::<f64>(1)?))
                .func("mul", |_, p| Ok(p.arg::<f64>(0)? * p.arg::<f64>(1)?)),
        )
        .func("echo", |_, p| Ok(Value::Array(p.into_inner())))
        .procedure("notify", |ctx, p| async move {
            let message: String = p.arg(0)?;
            match ctx.server::<Connection>() {
                Some(conn) => info!("Notification from {}: {}", conn.peer_addr, message),
                None => info!("Notification: {}", message),
            }
            Ok(())
        })
        .handler("sleep", |_, p| async move {
            let ms: u64 = p.arg(0)?;
            if ms > MAX_SLEEP_MS {
                anyhow::bail!("refusing to sleep for {} ms", ms);
            }
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
        .func("fail", |_, p| -> anyhow::Result<Value> {
            let message: Option<String> = p.opt_arg(0)?;
            anyhow::bail!(message.unwrap_or_else(|| "requested failure".to_string()))
        })
        .object("cards", cards())
        .build()
}
