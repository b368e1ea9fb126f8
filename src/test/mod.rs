use std::sync::{Arc, Mutex};

use crate::{
    dispatch::{Callback, GuestCpu},
    Gva,
};

// CPU whose program counter is fixed at construction
#[derive(Clone, Copy, Debug)]
pub struct TestCpu(pub Gva);

impl GuestCpu for TestCpu {
    fn pc(&self) -> Gva {
        self.0
    }
}

// Shared record of which callbacks ran, in order
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    // Callback that appends `label` to the log every time it runs
    pub fn recorder(&self, label: &'static str) -> Callback {
        let log = self.0.clone();
        Box::new(move |_, _| log.lock().unwrap().push(label))
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}
