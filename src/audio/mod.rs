//! Audio capture, buffering and playback.

pub mod capture;
pub mod cpal_backend;
pub mod device;
pub mod dsp;
pub mod frame;
pub mod playback;
pub mod ring_buffer;
pub mod virtual_device;
pub mod wav;
