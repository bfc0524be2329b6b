#![allow(dead_code)]

use std::{fs, path::Path};

use async_trait::async_trait;
use courier_common::Mail;
use courier_mailer::{SendError, Sender};
use parking_lot::Mutex;

/// Records every email instead of sending it
#[derive(Debug, Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<(Mail, String)>>,
    pub fail: bool,
}

impl RecordingSender {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, mail: &Mail, html: String) -> Result<(), SendError> {
        if self.fail {
            return Err(SendError::Address {
                address: mail.from.clone(),
                source: "refused".parse::<lettre::Address>().unwrap_err(),
            });
        }

        self.sent.lock().push((mail.clone(), html));
        Ok(())
    }
}

pub fn write(root: &Path, name: &str, source: &str) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, source).unwrap();
}
