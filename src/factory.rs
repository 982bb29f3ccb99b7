use crate::core::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Creates and destroys the component state held by cached instances.
///
/// The cache calls `create` on first use of an identity, `destroy` when an
/// instance is removed or discarded, and the lifecycle hooks around every
/// serialization boundary. State must serialize, since idle instances move to
/// a passivation store and back.
#[async_trait]
pub trait InstanceFactory: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Send + 'static;

    /// Produce fresh state for a first-use instance.
    async fn create(&self) -> Result<Self::State>;

    /// Tear down state on removal. Failures are reported to the caller but
    /// never block slot reclamation.
    async fn destroy(&self, state: Self::State) -> Result<()> {
        let _ = state;
        Ok(())
    }

    /// Invoked just before the state is serialized into a store.
    fn on_passivate(&self, _state: &mut Self::State) {}

    /// Invoked just after the state is deserialized out of a store.
    fn on_activate(&self, _state: &mut Self::State) {}
}
