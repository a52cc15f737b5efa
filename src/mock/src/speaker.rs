use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use elbd_route::{
    error::Error,
    speaker::{Route, Speaker},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(IpAddr, Vec<IpAddr>),
    Delete(IpAddr, Vec<IpAddr>),
}

/// In-memory speaker recording every mutation it receives.
#[derive(Debug, Clone, Default)]
pub struct MockSpeaker {
    inner: Arc<Mutex<MockSpeakerInner>>,
}

#[derive(Debug, Default)]
struct MockSpeakerInner {
    routes: BTreeMap<IpAddr, BTreeSet<IpAddr>>,
    calls: Vec<Call>,
    unavailable: bool,
}

impl MockSpeaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(self, prefix: IpAddr, nexthops: &[IpAddr]) -> Self {
        self.inner
            .lock()
            .unwrap()
            .routes
            .insert(prefix, nexthops.iter().copied().collect());
        self
    }

    /// Makes every following call fail as if the speaker were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unwrap().unavailable = unavailable;
    }

    pub fn routes(&self) -> BTreeMap<IpAddr, BTreeSet<IpAddr>> {
        self.inner.lock().unwrap().routes.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }
}

#[async_trait]
impl Speaker for MockSpeaker {
    async fn add_route(&self, prefix: IpAddr, nexthops: &[IpAddr]) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(Error::Timeout);
        }
        inner.calls.push(Call::Add(prefix, nexthops.to_vec()));
        inner
            .routes
            .entry(prefix)
            .or_default()
            .extend(nexthops.iter().copied());
        Ok(())
    }

    async fn delete_routes(&self, prefix: IpAddr, nexthops: &[IpAddr]) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(Error::Timeout);
        }
        inner.calls.push(Call::Delete(prefix, nexthops.to_vec()));
        let remove = match inner.routes.get_mut(&prefix) {
            None => false,
            Some(current) => {
                current.retain(|n| !nexthops.is_empty() && !nexthops.contains(n));
                current.is_empty()
            }
        };
        if remove {
            inner.routes.remove(&prefix);
        }
        Ok(())
    }

    async fn get_route(&self, prefix: IpAddr, prefix_len: u8) -> Result<Option<Route>, Error> {
        let inner = self.inner.lock().unwrap();
        if inner.unavailable {
            return Err(Error::Timeout);
        }
        Ok(inner.routes.get(&prefix).map(|nexthops| Route {
            prefix: ipnet::IpNet::new(prefix, prefix_len).unwrap(),
            nexthops: nexthops.clone(),
        }))
    }
}
