//! The durable swap record and its state machine.
//!
//! A `Swap` carries everything both parties must agree on: the offer, the
//! role split, block-height timeouts per chain, funding anchors and the
//! secret pair. State transitions follow a fixed DAG; timeout bookkeeping is
//! block-height based (the advisory time locks are derived, never enforced).

use crate::chains;
use crate::error::{Error, Result};
use crate::types::{Network, Role, SwapMethod};
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

/// Minimum blocks that must remain before a chain's timeout for the
/// happy-path completion to be considered safe.
pub const SAFETY_MARGIN_BLOCKS: u64 = 6;

/// Lifecycle state of a swap.
///
/// `init -> funding -> funded -> {redeemed | refunded}`; `init -> cancelled`;
/// `funding -> {refunded, failed}`. Terminal states have no exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapState {
    Init,
    Funding,
    Funded,
    Redeemed,
    Refunded,
    Failed,
    Cancelled,
}

impl SwapState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SwapState::Redeemed | SwapState::Refunded | SwapState::Failed | SwapState::Cancelled
        )
    }

    /// Whether `self -> to` is an edge of the state DAG.
    pub fn can_transition_to(self, to: SwapState) -> bool {
        use SwapState::*;
        matches!(
            (self, to),
            (Init, Funding)
                | (Init, Cancelled)
                | (Funding, Funded)
                | (Funding, Refunded)
                | (Funding, Failed)
                | (Funded, Redeemed)
                | (Funded, Refunded)
        )
    }
}

impl std::fmt::Display for SwapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SwapState::Init => "init",
            SwapState::Funding => "funding",
            SwapState::Funded => "funded",
            SwapState::Redeemed => "redeemed",
            SwapState::Refunded => "refunded",
            SwapState::Failed => "failed",
            SwapState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// The two chains of a swap, named from the maker's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainSide {
    /// The chain the maker offers value on (and funds).
    Offer,
    /// The chain the maker requests value on (funded by the taker).
    Request,
}

impl ChainSide {
    pub fn other(self) -> ChainSide {
        match self {
            ChainSide::Offer => ChainSide::Request,
            ChainSide::Request => ChainSide::Offer,
        }
    }
}

/// The terms both parties agreed on via the order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub offer_chain: String,
    /// Smallest unit of the offer chain (satoshi / wei).
    pub offer_amount: u64,
    pub request_chain: String,
    pub request_amount: u64,
    pub method: SwapMethod,
    /// Unix timestamp after which the offer is void.
    pub expires_at: i64,
}

/// Funding anchor for one side of the swap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundingStatus {
    pub tx_id: Option<String>,
    pub vout: u32,
    pub confirmations: u32,
}

/// Validate the maker/taker timeout pair for one chain.
///
/// The maker must outlast the taker by at least `max(6, taker / 10)` blocks,
/// otherwise the taker could refund while the maker is still committed.
pub fn validate_timeout_relationship(maker: u64, taker: u64) -> Result<()> {
    let min_gap = 6.max(taker / 10);
    if maker <= taker || maker - taker < min_gap {
        return Err(Error::TimeoutRelationship {
            maker,
            taker,
            min_gap,
        });
    }
    Ok(())
}

/// The durable protocol state for one trade.
#[derive(Debug, Clone)]
pub struct Swap {
    /// Trade id assigned by the order-matching layer.
    pub id: String,
    pub order_id: String,
    pub network: Network,
    pub method: SwapMethod,
    pub role: Role,
    pub state: SwapState,
    pub offer: Offer,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Advisory time-based lock durations, derived from block timeouts.
    pub offer_lock_duration_secs: u64,
    pub request_lock_duration_secs: u64,
    /// Authoritative block-height timeouts per chain.
    pub offer_chain_start_height: u64,
    pub offer_chain_timeout_height: u64,
    pub request_chain_start_height: u64,
    pub request_chain_timeout_height: u64,
    /// Long-lived public keys for this swap.
    pub local_pub: Option<PublicKey>,
    pub remote_pub: Option<PublicKey>,
    /// 32-byte preimage; only the initiator holds it from the start.
    pub secret: Option<[u8; 32]>,
    pub secret_hash: Option<[u8; 32]>,
    pub local_funding: FundingStatus,
    pub remote_funding: FundingStatus,
    /// Redemption destinations per chain, collected via the peer protocol.
    pub local_redeem_addresses: HashMap<String, String>,
    pub remote_redeem_addresses: HashMap<String, String>,
}

impl Swap {
    /// Create a swap in `init`, validating the registry entries and the
    /// timeout relationship on both chains.
    pub fn new(
        id: String,
        order_id: String,
        offer: Offer,
        role: Role,
        network: Network,
    ) -> Result<Self> {
        let offer_chain = chains::get(&offer.offer_chain)?;
        let request_chain = chains::get(&offer.request_chain)?;

        for chain in [offer_chain, request_chain] {
            validate_timeout_relationship(
                u64::from(chain.maker_timeout_blocks),
                u64::from(chain.taker_timeout_blocks),
            )?;
        }

        let offer_lock_duration_secs =
            u64::from(offer_chain.maker_timeout_blocks) * offer_chain.block_time_secs;
        let request_lock_duration_secs =
            u64::from(request_chain.taker_timeout_blocks) * request_chain.block_time_secs;

        Ok(Self {
            id,
            order_id,
            network,
            method: offer.method,
            role,
            state: SwapState::Init,
            offer,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
            offer_lock_duration_secs,
            request_lock_duration_secs,
            offer_chain_start_height: 0,
            offer_chain_timeout_height: 0,
            request_chain_start_height: 0,
            request_chain_timeout_height: 0,
            local_pub: None,
            remote_pub: None,
            secret: None,
            secret_hash: None,
            local_funding: FundingStatus::default(),
            remote_funding: FundingStatus::default(),
            local_redeem_addresses: HashMap::new(),
            remote_redeem_addresses: HashMap::new(),
        })
    }

    /// Apply a state transition, rejecting edges outside the DAG.
    pub fn transition(&mut self, to: SwapState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidState {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        log::debug!("swap {}: {} -> {}", self.id, self.state, to);
        self.state = to;
        Ok(())
    }

    /// The maker always funds the offer chain; the taker the request chain.
    pub fn is_maker(&self) -> bool {
        self.role.is_maker()
    }

    /// The chain side the local role funds.
    pub fn funding_side(&self) -> ChainSide {
        match self.role {
            Role::Initiator => ChainSide::Offer,
            Role::Responder => ChainSide::Request,
        }
    }

    pub fn chain_symbol(&self, side: ChainSide) -> &str {
        match side {
            ChainSide::Offer => &self.offer.offer_chain,
            ChainSide::Request => &self.offer.request_chain,
        }
    }

    /// The symbol of the chain the local role funds.
    pub fn funding_chain(&self) -> &str {
        self.chain_symbol(self.funding_side())
    }

    /// Refund timeout in blocks on `side`: the maker's count on the offer
    /// chain, the taker's on the request chain.
    pub fn timeout_blocks(&self, side: ChainSide) -> Result<u16> {
        let chain = chains::get(self.chain_symbol(side))?;
        Ok(match side {
            ChainSide::Offer => chain.maker_timeout_blocks,
            ChainSide::Request => chain.taker_timeout_blocks,
        })
    }

    /// Anchor both timeout heights at the current chain tips.
    pub fn set_block_heights(&mut self, offer_height: u64, request_height: u64) -> Result<()> {
        self.offer_chain_start_height = offer_height;
        self.offer_chain_timeout_height =
            offer_height + u64::from(self.timeout_blocks(ChainSide::Offer)?);
        self.request_chain_start_height = request_height;
        self.request_chain_timeout_height =
            request_height + u64::from(self.timeout_blocks(ChainSide::Request)?);
        Ok(())
    }

    pub fn timeout_height(&self, side: ChainSide) -> u64 {
        match side {
            ChainSide::Offer => self.offer_chain_timeout_height,
            ChainSide::Request => self.request_chain_timeout_height,
        }
    }

    /// Whether `side`'s escrow is refundable at `height`. Monotone in height.
    pub fn can_refund_by_block(&self, height: u64, side: ChainSide) -> bool {
        let timeout = self.timeout_height(side);
        timeout > 0 && height >= timeout
    }

    /// Blocks left until `side`'s refund path opens; 0 at and past timeout.
    pub fn blocks_until_refund(&self, height: u64, side: ChainSide) -> u64 {
        self.timeout_height(side).saturating_sub(height)
    }

    /// Reject happy-path completion when either chain is inside the safety
    /// margin of its timeout.
    pub fn is_safe_to_complete(
        &self,
        offer_height: u64,
        request_height: u64,
        margin: u64,
    ) -> Result<()> {
        for (side, height) in [
            (ChainSide::Offer, offer_height),
            (ChainSide::Request, request_height),
        ] {
            let blocks_left = self.blocks_until_refund(height, side);
            if blocks_left < margin {
                return Err(Error::TimeoutRace {
                    chain: self.chain_symbol(side).to_string(),
                    blocks_left,
                    margin,
                });
            }
        }
        Ok(())
    }

    /// Funding is final once both sides cross their chain's confirmation
    /// minimum.
    pub fn confirmations_final(&self) -> Result<bool> {
        let local_chain = chains::get(self.chain_symbol(self.funding_side()))?;
        let remote_chain = chains::get(self.chain_symbol(self.funding_side().other()))?;
        Ok(self.local_funding.tx_id.is_some()
            && self.remote_funding.tx_id.is_some()
            && self.local_funding.confirmations >= local_chain.min_confirmations
            && self.remote_funding.confirmations >= remote_chain.min_confirmations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> Offer {
        Offer {
            offer_chain: "BTC".to_string(),
            offer_amount: 100_000,
            request_chain: "LTC".to_string(),
            request_amount: 1_000_000,
            method: SwapMethod::Musig2,
            expires_at: 0,
        }
    }

    fn swap(role: Role) -> Swap {
        Swap::new(
            "t1".to_string(),
            "o1".to_string(),
            offer(),
            role,
            Network::Regtest,
        )
        .unwrap()
    }

    #[test]
    fn timeout_relationship_accepts_defaults() {
        validate_timeout_relationship(144, 72).unwrap();
        validate_timeout_relationship(576, 288).unwrap();
    }

    #[test]
    fn timeout_relationship_rejects_bad_pairs() {
        assert!(validate_timeout_relationship(72, 72).is_err());
        assert!(validate_timeout_relationship(60, 72).is_err());
        // Gap below max(6, taker/10).
        assert!(validate_timeout_relationship(75, 72).is_err());
        assert!(validate_timeout_relationship(290, 288).is_err());
        // Exactly at the gap passes.
        validate_timeout_relationship(78, 72).unwrap();
    }

    #[test]
    fn reachable_states_are_exactly_the_dag() {
        use SwapState::*;
        let all = [Init, Funding, Funded, Redeemed, Refunded, Failed, Cancelled];

        // Breadth-first closure from Init.
        let mut reachable = vec![Init];
        let mut frontier = vec![Init];
        while let Some(state) = frontier.pop() {
            for next in all {
                if state.can_transition_to(next) && !reachable.contains(&next) {
                    reachable.push(next);
                    frontier.push(next);
                }
            }
        }
        for state in all {
            assert!(reachable.contains(&state), "{state} unreachable");
        }

        // Terminal states have out-degree 0.
        for terminal in [Redeemed, Refunded, Failed, Cancelled] {
            for next in all {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut s = swap(Role::Initiator);
        assert!(matches!(
            s.transition(SwapState::Funded),
            Err(Error::InvalidState { .. })
        ));
        s.transition(SwapState::Funding).unwrap();
        s.transition(SwapState::Funded).unwrap();
        s.transition(SwapState::Redeemed).unwrap();
        assert!(s.state.is_terminal());
    }

    #[test]
    fn block_heights_use_role_specific_timeouts() {
        let mut s = swap(Role::Initiator);
        s.set_block_heights(1_000, 2_000).unwrap();
        // Maker funds BTC with the maker count, taker funds LTC with the
        // taker count.
        assert_eq!(s.offer_chain_timeout_height, 1_000 + 144);
        assert_eq!(s.request_chain_timeout_height, 2_000 + 288);
    }

    #[test]
    fn refund_eligibility_is_monotone() {
        let mut s = swap(Role::Initiator);
        s.set_block_heights(1_000, 2_000).unwrap();

        let timeout = s.timeout_height(ChainSide::Offer);
        let mut was_refundable = false;
        for h in (timeout - 3)..(timeout + 3) {
            let now = s.can_refund_by_block(h, ChainSide::Offer);
            assert!(!was_refundable || now, "refundability regressed at {h}");
            was_refundable = now;
        }
        assert_eq!(s.blocks_until_refund(timeout - 1, ChainSide::Offer), 1);
        assert_eq!(s.blocks_until_refund(timeout, ChainSide::Offer), 0);
        assert_eq!(s.blocks_until_refund(timeout + 10, ChainSide::Offer), 0);
    }

    #[test]
    fn completion_is_rejected_inside_the_margin() {
        let mut s = swap(Role::Initiator);
        s.set_block_heights(1_000, 2_000).unwrap();

        // 5 blocks left on the offer chain, margin 6.
        let offer_height = s.offer_chain_timeout_height - 5;
        let err = s
            .is_safe_to_complete(offer_height, 2_000, SAFETY_MARGIN_BLOCKS)
            .unwrap_err();
        match err {
            Error::TimeoutRace {
                chain,
                blocks_left,
                margin,
            } => {
                assert_eq!(chain, "BTC");
                assert_eq!(blocks_left, 5);
                assert_eq!(margin, 6);
            }
            other => panic!("expected TimeoutRace, got {other:?}"),
        }

        s.is_safe_to_complete(1_010, 2_010, SAFETY_MARGIN_BLOCKS)
            .unwrap();
    }

    #[test]
    fn confirmations_gate_on_both_chains() {
        let mut s = swap(Role::Initiator);
        s.local_funding.tx_id = Some("aa".to_string());
        s.remote_funding.tx_id = Some("bb".to_string());

        s.local_funding.confirmations = 3; // BTC minimum
        s.remote_funding.confirmations = 5; // below LTC minimum of 6
        assert!(!s.confirmations_final().unwrap());

        s.remote_funding.confirmations = 6;
        assert!(s.confirmations_final().unwrap());
    }
}
