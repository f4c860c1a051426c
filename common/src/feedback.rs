use crate::{
    config::FeedbackPattern,
    ports::{GpioPort, SystemControl},
    types::Direction,
};

/// Non-blocking indicator toggled from the tick loop while provisioning.
#[derive(Debug, Clone)]
pub struct FeedbackBlinker {
    pin: Option<u8>,
    interval_ms: u64,
    last_toggle_ms: Option<u64>,
    lit: bool,
}

impl FeedbackBlinker {
    pub fn new(pin: Option<u8>, interval_ms: u64) -> Self {
        Self {
            pin,
            interval_ms,
            last_toggle_ms: None,
            lit: false,
        }
    }

    pub fn configure(&self, gpio: &mut impl GpioPort) {
        if let Some(pin) = self.pin {
            gpio.configure(pin, Direction::Output);
            gpio.digital_write(pin, false);
        }
    }

    pub fn tick(&mut self, now_ms: u64, gpio: &mut impl GpioPort) {
        let Some(pin) = self.pin else {
            return;
        };
        let due = self
            .last_toggle_ms
            .map_or(true, |last| now_ms.saturating_sub(last) > self.interval_ms);
        if due {
            self.lit = !self.lit;
            self.last_toggle_ms = Some(now_ms);
            gpio.digital_write(pin, self.lit);
        }
    }

    pub fn stop(&mut self, gpio: &mut impl GpioPort) {
        if let Some(pin) = self.pin {
            gpio.digital_write(pin, false);
        }
        self.lit = false;
        self.last_toggle_ms = None;
    }

    /// Plays `pattern` and only returns once it has finished.
    pub fn play(
        &mut self,
        pattern: FeedbackPattern,
        gpio: &mut impl GpioPort,
        system: &mut impl SystemControl,
    ) {
        let Some(pin) = self.pin else {
            return;
        };
        self.stop(gpio);
        for _ in 0..pattern.cycles {
            gpio.digital_write(pin, true);
            system.delay_ms(pattern.period_ms);
            gpio.digital_write(pin, false);
            system.delay_ms(pattern.period_ms);
        }
    }
}
