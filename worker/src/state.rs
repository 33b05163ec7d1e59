use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::session::GuildSession;

pub struct State {
  pub sessions: RwLock<HashMap<u64, Arc<GuildSession>>>
}

impl State {
  pub fn new() -> Self {
    Self { sessions: RwLock::new(HashMap::new()) }
  }
}

impl Default for State {
  fn default() -> Self {
    Self::new()
  }
}
