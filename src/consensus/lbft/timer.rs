// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! One shot cancelable timers.
//!
//! Timers hold a deadline only; the owner polls them with the current
//! instant so that every expiration is handled by the owner thread.

use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    /// (Re)arm the timer.
    pub fn start(&mut self, now: Instant, after: Duration) {
        self.deadline = Some(now + after);
    }

    /// Arm the timer unless it is already armed.
    pub fn start_once(&mut self, now: Instant, after: Duration) {
        if self.deadline.is_none() {
            self.start(now, after);
        }
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once when the deadline is reached; the timer is then disarmed.
    pub fn fired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of the armed deadlines.
pub fn earliest<I: IntoIterator<Item = Option<Instant>>>(deadlines: I) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once() {
        let now = Instant::now();
        let mut timer = Timer::default();
        timer.start(now, Duration::from_millis(100));

        assert!(!timer.fired(now + Duration::from_millis(99)));
        assert!(timer.fired(now + Duration::from_millis(100)));
        assert!(!timer.fired(now + Duration::from_millis(200)));
        assert!(!timer.is_armed());
    }

    #[test]
    fn stop_and_restart() {
        let now = Instant::now();
        let mut timer = Timer::default();
        timer.start(now, Duration::from_millis(100));

        timer.stop();
        assert!(!timer.fired(now + Duration::from_secs(1)));
        timer.start_once(now, Duration::from_millis(10));
        timer.start_once(now, Duration::from_millis(500));

        assert_eq!(timer.deadline(), Some(now + Duration::from_millis(10)));
    }

    #[test]
    fn earliest_deadline() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);

        assert_eq!(earliest(vec![None, Some(later), Some(now)]), Some(now));
        assert_eq!(earliest(vec![None, None]), None);
    }
}
