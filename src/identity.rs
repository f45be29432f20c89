/// Supplies the acting user's identifier for audit stamps
pub trait ActorProvider: Send + Sync {
    fn current_actor_id(&self) -> String;
}

/// Fixed actor, e.g. the configured default or one taken from a request header
#[derive(Debug, Clone)]
pub struct StaticActor {
    actor_id: String,
}

impl StaticActor {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
        }
    }
}

impl ActorProvider for StaticActor {
    fn current_actor_id(&self) -> String {
        self.actor_id.clone()
    }
}
