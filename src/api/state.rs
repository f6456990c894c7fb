use crate::scheduler::JobStore;

#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
}
