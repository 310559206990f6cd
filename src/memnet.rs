//! In-process gossip provider. Records every call, supports fault injection,
//! and backs both the offline `simulate` command and the integration tests.

use crate::{
    error::{DefenseError, DefenseResult},
    network::GossipNetwork,
    relay::FriendNode,
    subnet::{SubnetId, SubnetSet},
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PushRecord {
    pub peer_id: String,
    pub payload: Vec<u8>,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOp {
    Subscribe,
    Unsubscribe,
}

#[derive(Default)]
struct State {
    subscribed: SubnetSet,
    peak_subscribed: usize,
    log: Vec<(SubscriptionOp, SubnetId)>,
    published: Vec<(String, Vec<u8>)>,
    pushes: Vec<PushRecord>,
    failing_subnets: HashSet<SubnetId>,
    unreachable: HashSet<String>,
    push_delay: HashMap<String, Duration>,
    call_delay: Option<Duration>,
    publish_fails: bool,
}

#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<State>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network that already carries the node's backbone subscriptions.
    pub fn with_backbone(backbone: &SubnetSet) -> Self {
        let net = Self::default();
        {
            let mut st = net.lock();
            st.subscribed = backbone.clone();
            st.peak_subscribed = backbone.len();
        }
        net
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not hide the recorded state from the others.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn fail_subnet(&self, subnet: SubnetId) {
        self.lock().failing_subnets.insert(subnet);
    }

    pub fn heal_subnet(&self, subnet: SubnetId) {
        self.lock().failing_subnets.remove(&subnet);
    }

    pub fn set_unreachable(&self, peer_id: &str) {
        self.lock().unreachable.insert(peer_id.to_string());
    }

    pub fn set_push_delay(&self, peer_id: &str, delay: Duration) {
        self.lock().push_delay.insert(peer_id.to_string(), delay);
    }

    /// Delay every subscribe and unsubscribe, to hold a reshuffle mid-flight.
    pub fn set_call_delay(&self, delay: Duration) {
        self.lock().call_delay = Some(delay);
    }

    async fn call_delay(&self) {
        let delay = self.lock().call_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }

    pub fn set_publish_fails(&self, fails: bool) {
        self.lock().publish_fails = fails;
    }

    pub fn subscribed(&self) -> SubnetSet {
        self.lock().subscribed.clone()
    }

    /// Largest number of simultaneous subscriptions ever held.
    pub fn peak_subscribed(&self) -> usize {
        self.lock().peak_subscribed
    }

    pub fn subscription_log(&self) -> Vec<(SubscriptionOp, SubnetId)> {
        self.lock().log.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    pub fn pushes(&self) -> Vec<PushRecord> {
        self.lock().pushes.clone()
    }
}

#[async_trait]
impl GossipNetwork for MemoryNetwork {
    async fn subscribe(&self, subnet: SubnetId) -> DefenseResult<()> {
        self.call_delay().await;
        let mut st = self.lock();
        st.log.push((SubscriptionOp::Subscribe, subnet));
        if st.failing_subnets.contains(&subnet) {
            return Err(DefenseError::TransientNetwork(format!("subscribe {} refused", subnet)));
        }
        st.subscribed.insert(subnet);
        st.peak_subscribed = st.peak_subscribed.max(st.subscribed.len());
        Ok(())
    }

    async fn unsubscribe(&self, subnet: SubnetId) -> DefenseResult<()> {
        self.call_delay().await;
        let mut st = self.lock();
        st.log.push((SubscriptionOp::Unsubscribe, subnet));
        if st.failing_subnets.contains(&subnet) {
            return Err(DefenseError::TransientNetwork(format!("unsubscribe {} refused", subnet)));
        }
        st.subscribed.remove(&subnet);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> DefenseResult<()> {
        let mut st = self.lock();
        if st.publish_fails {
            return Err(DefenseError::TransientNetwork("publish refused".into()));
        }
        st.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn push_to_peer(&self, friend: &FriendNode, payload: Vec<u8>) -> DefenseResult<()> {
        let (delay, unreachable) = {
            let st = self.lock();
            (
                st.push_delay.get(&friend.peer_id).copied(),
                st.unreachable.contains(&friend.peer_id),
            )
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if unreachable {
            return Err(DefenseError::TransientNetwork(format!("{} unreachable", friend.peer_id)));
        }
        self.lock().pushes.push(PushRecord {
            peer_id: friend.peer_id.clone(),
            payload,
            at: Instant::now(),
        });
        Ok(())
    }
}
