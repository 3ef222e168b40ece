use crate::detect::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}
