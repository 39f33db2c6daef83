//! The two PWM actuator modules (beeper and vibration motor) and the
//! controller word protocol they share.

pub mod beep;
pub mod buzz;
mod queue;
pub mod words;

pub use beep::{BeepModule, SPEC as BEEP_SPEC};
pub use buzz::{BuzzModule, SPEC as BUZZ_SPEC};
