// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

/// Digits of each SAS half.
pub const DEFAULT_NUMBER_OF_DIGITS_FOR_SAS: usize = 4;

pub const DEFAULT_INBOUND_CHANNEL_CAPACITY: usize = 128;

pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Configuration of a transfer manager.
///
/// Both devices need the same number of SAS digits, otherwise the user will never be able to
/// confirm a transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Digits of each of the two SAS halves.
    pub number_of_digits_for_sas: usize,

    /// Buffered commands and relay responses waiting to be processed.
    pub inbound_channel_capacity: usize,

    /// Buffered events not yet picked up by the application.
    pub event_channel_capacity: usize,
}

impl Config {
    pub fn full_sas_digits(&self) -> usize {
        self.number_of_digits_for_sas * 2
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            number_of_digits_for_sas: DEFAULT_NUMBER_OF_DIGITS_FOR_SAS,
            inbound_channel_capacity: DEFAULT_INBOUND_CHANNEL_CAPACITY,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}
