//! Fixtures shared by unit tests across modules.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use mockable::Clock;
use uuid::Uuid;

use crate::schemas::{MemberId, Session};

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(fixture_time()),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

pub fn fixture_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53)
        .single()
        .expect("valid fixture timestamp")
}

pub fn member_id(n: u128) -> MemberId {
    Uuid::from_u128(n)
}

pub fn session_for(account_id: &str, email: &str, member: u128, name: &str) -> Session {
    Session {
        account_id: account_id.to_owned(),
        email: email.to_owned(),
        member_id: member_id(member),
        name: name.to_owned(),
    }
}
