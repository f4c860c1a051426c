use crate::{error::RegistryError, ports::GpioPort, types::Direction};

pub const CHANNEL_ID_MAX_LEN: usize = 16;
pub const CHANNEL_NAME_MAX_LEN: usize = 20;
pub const MAX_CHANNELS: usize = 5;
pub const ANALOG_MAX: u16 = 1023;
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1_000;

pub type ChannelId = heapless::String<CHANNEL_ID_MAX_LEN>;
pub type ChannelName = heapless::String<CHANNEL_NAME_MAX_LEN>;

/// Copies as much of `value` as fits, stopping at a character boundary.
fn bounded<const N: usize>(value: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for ch in value.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Discovery schema of the single value a channel exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: String,
    pub name: String,
    pub datatype: String,
    pub unit: Option<String>,
    pub format: Option<String>,
    pub settable: bool,
    pub retained: bool,
}

impl Property {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            datatype: "string".to_string(),
            unit: None,
            format: None,
            settable: false,
            retained: true,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_datatype(mut self, datatype: &str) -> Self {
        self.datatype = datatype.to_string();
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string()).filter(|unit| !unit.is_empty());
        self
    }

    pub fn with_format(mut self, format: &str) -> Self {
        self.format = Some(format.to_string()).filter(|format| !format.is_empty());
        self
    }

    pub fn with_settable(mut self, settable: bool) -> Self {
        self.settable = settable;
        self
    }

    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }
}

/// One physical I/O line.
///
/// Logical state `0` is the inactive level. For digital lines the only other
/// value is `1`; analog lines carry the raw `0..=ANALOG_MAX` range. The
/// `inverted` flag is applied only at the pin, so everything above the GPIO
/// port works in logical terms.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    name: ChannelName,
    pin: u8,
    direction: Direction,
    analog: bool,
    inverted: bool,
    state: u16,
    previous_state: u16,
    enabled: bool,
    timer_ms: u64,
    revert_deadline_ms: Option<u64>,
    next_sample_ms: Option<u64>,
    property: Option<Property>,
}

impl Channel {
    pub fn new(id: &str, name: &str, pin: u8, direction: Direction) -> Self {
        Self {
            id: bounded(id),
            name: bounded(name),
            pin,
            direction,
            analog: false,
            inverted: false,
            state: 0,
            previous_state: 0,
            enabled: true,
            timer_ms: 0,
            revert_deadline_ms: None,
            next_sample_ms: None,
            property: None,
        }
    }

    pub fn with_analog(mut self, analog: bool) -> Self {
        self.analog = analog;
        self.state = self.clamp(self.state);
        self
    }

    pub fn with_inverted(mut self, inverted: bool) -> Self {
        self.inverted = inverted;
        self
    }

    pub fn with_timer_ms(mut self, timer_ms: u64) -> Self {
        self.timer_ms = timer_ms;
        self
    }

    pub fn with_initial_state(mut self, state: u16) -> Self {
        self.state = self.clamp(state);
        self.previous_state = self.state;
        self
    }

    pub fn with_property(mut self, property: Property) -> Self {
        self.property = Some(property);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }

    pub fn is_analog(&self) -> bool {
        self.analog
    }

    pub fn is_binary(&self) -> bool {
        !self.analog
    }

    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    pub fn state(&self) -> u16 {
        self.state
    }

    pub fn previous_state(&self) -> u16 {
        self.previous_state
    }

    pub fn is_active(&self) -> bool {
        self.state != 0
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn timer_ms(&self) -> u64 {
        self.timer_ms
    }

    pub fn revert_deadline_ms(&self) -> Option<u64> {
        self.revert_deadline_ms
    }

    /// The explicit schema if one was configured, otherwise one derived from
    /// the channel's direction and mode.
    pub fn property(&self) -> Property {
        self.property.clone().unwrap_or_else(|| {
            Property::new("state")
                .with_name(&self.name)
                .with_datatype(if self.analog { "integer" } else { "boolean" })
                .with_settable(self.is_output())
        })
    }

    /// Input lines are polled at the channel timer when one is set.
    pub fn sample_interval_ms(&self) -> u64 {
        if self.timer_ms > 0 {
            self.timer_ms
        } else {
            DEFAULT_SAMPLE_INTERVAL_MS
        }
    }

    /// Sets the pin mode and brings the pin in line with the logical state.
    pub fn init_pin(&mut self, gpio: &mut impl GpioPort) {
        gpio.configure(self.pin, self.direction);
        match self.direction {
            Direction::Output => self.drive(gpio),
            Direction::Input => {
                self.state = self.sample(gpio);
                self.previous_state = self.state;
            }
        }
    }

    /// Drives an enabled output to `value`. Returns whether the logical state
    /// changed; a disabled channel or an input never changes.
    pub fn write(&mut self, value: u16, now_ms: u64, gpio: &mut impl GpioPort) -> bool {
        if !self.is_output() || !self.enabled {
            return false;
        }
        self.apply(value, now_ms, gpio)
    }

    /// Returns the output to the state it held before the last transition.
    /// Runs even when the channel was disabled after the timer was armed.
    pub fn revert(&mut self, now_ms: u64, gpio: &mut impl GpioPort) -> bool {
        if !self.is_output() {
            return false;
        }
        let target = self.previous_state;
        let changed = self.apply(target, now_ms, gpio);
        self.revert_deadline_ms = None;
        changed
    }

    pub fn time_is_up(&self, now_ms: u64) -> bool {
        self.revert_deadline_ms
            .is_some_and(|deadline| now_ms >= deadline)
    }

    /// Samples an input line if its poll interval has elapsed. Returns whether
    /// a new sample was taken.
    pub fn read(&mut self, now_ms: u64, gpio: &mut impl GpioPort) -> bool {
        if self.is_output() {
            return false;
        }
        if self.next_sample_ms.is_some_and(|next| now_ms < next) {
            return false;
        }

        self.next_sample_ms = Some(now_ms.saturating_add(self.sample_interval_ms()));
        let sample = self.sample(gpio);
        self.previous_state = self.state;
        self.state = sample;
        true
    }

    pub fn rename(&mut self, name: &str) -> bool {
        let name: ChannelName = bounded(name);
        if self.name == name {
            return false;
        }
        self.name = name;
        true
    }

    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.enabled == enabled {
            return false;
        }
        self.enabled = enabled;
        true
    }

    pub fn set_timer(&mut self, timer_ms: u64) -> bool {
        if self.timer_ms == timer_ms {
            return false;
        }
        self.timer_ms = timer_ms;
        true
    }

    fn apply(&mut self, value: u16, now_ms: u64, gpio: &mut impl GpioPort) -> bool {
        let value = self.clamp(value);
        if value == self.state {
            if value == 0 {
                self.revert_deadline_ms = None;
            }
            return false;
        }

        self.previous_state = self.state;
        self.state = value;
        self.drive(gpio);

        if value == 0 {
            self.revert_deadline_ms = None;
        } else if self.timer_ms > 0 {
            self.revert_deadline_ms = Some(now_ms.saturating_add(self.timer_ms));
        }
        true
    }

    fn clamp(&self, value: u16) -> u16 {
        if self.analog {
            value.min(ANALOG_MAX)
        } else {
            u16::from(value != 0)
        }
    }

    fn drive(&self, gpio: &mut impl GpioPort) {
        if self.analog {
            let level = if self.inverted {
                ANALOG_MAX - self.state
            } else {
                self.state
            };
            gpio.analog_write(self.pin, level);
        } else {
            gpio.digital_write(self.pin, (self.state != 0) != self.inverted);
        }
    }

    fn sample(&self, gpio: &mut impl GpioPort) -> u16 {
        if self.analog {
            let raw = gpio.analog_read(self.pin).min(ANALOG_MAX);
            if self.inverted {
                ANALOG_MAX - raw
            } else {
                raw
            }
        } else {
            u16::from(gpio.digital_read(self.pin) != self.inverted)
        }
    }
}

/// Fixed-capacity, insertion-ordered set of channels.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: heapless::Vec<Channel, MAX_CHANNELS>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, channel: Channel) -> Result<usize, RegistryError> {
        if self.find(channel.id()).is_some() {
            return Err(RegistryError::DuplicateId);
        }
        self.channels
            .push(channel)
            .map_err(|_| RegistryError::Full {
                capacity: MAX_CHANNELS,
            })?;
        Ok(self.channels.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn capacity(&self) -> usize {
        MAX_CHANNELS
    }

    pub fn get(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Channel> {
        self.channels.get_mut(index)
    }

    pub fn find(&self, id: &str) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.id() == id)
    }

    pub fn position_by_name(&self, name: &str) -> Option<usize> {
        self.channels
            .iter()
            .position(|channel| channel.name() == name)
    }

    /// True when a channel other than `except` would end up with `name`.
    pub fn name_taken(&self, name: &str, except: usize) -> bool {
        let name: ChannelName = bounded(name);
        self.channels
            .iter()
            .enumerate()
            .any(|(index, channel)| index != except && channel.name() == name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingGpio;
    use pretty_assertions::assert_eq;

    fn relay(timer_ms: u64) -> Channel {
        Channel::new("relay1", "lamp", 5, Direction::Output).with_timer_ms(timer_ms)
    }

    #[test]
    fn active_write_arms_timer_until_elapsed() {
        let mut gpio = RecordingGpio::default();
        let mut channel = relay(60_000);

        assert!(channel.write(1, 1_000, &mut gpio));
        assert!(!channel.time_is_up(1_000));
        assert!(!channel.time_is_up(60_999));
        assert!(channel.time_is_up(61_000));
    }

    #[test]
    fn inactive_write_cancels_pending_revert() {
        let mut gpio = RecordingGpio::default();
        let mut channel = relay(10_000);

        channel.write(1, 0, &mut gpio);
        assert!(channel.write(0, 500, &mut gpio));

        assert_eq!(channel.revert_deadline_ms(), None);
        assert!(!channel.time_is_up(20_000));
    }

    #[test]
    fn writing_same_value_twice_reports_no_change() {
        let mut gpio = RecordingGpio::default();
        let mut channel = relay(0);

        assert!(channel.write(1, 0, &mut gpio));
        assert!(!channel.write(1, 10, &mut gpio));
        assert_eq!(gpio.writes, vec![(5, 1)]);
    }

    #[test]
    fn zero_timer_never_schedules_revert() {
        let mut gpio = RecordingGpio::default();
        let mut channel = relay(0);

        channel.write(1, 0, &mut gpio);

        assert_eq!(channel.revert_deadline_ms(), None);
    }

    #[test]
    fn disabled_output_ignores_writes() {
        let mut gpio = RecordingGpio::default();
        let mut channel = relay(0);
        channel.set_enabled(false);

        assert!(!channel.write(1, 0, &mut gpio));
        assert_eq!(channel.state(), 0);
        assert!(gpio.writes.is_empty());
    }

    #[test]
    fn revert_restores_previous_state_and_clears_deadline() {
        let mut gpio = RecordingGpio::default();
        let mut channel = relay(1_000);

        channel.write(1, 0, &mut gpio);
        assert!(channel.revert(1_000, &mut gpio));

        assert_eq!(channel.state(), 0);
        assert_eq!(channel.previous_state(), 1);
        assert_eq!(channel.revert_deadline_ms(), None);
    }

    #[test]
    fn analog_revert_to_active_level_does_not_rearm() {
        let mut gpio = RecordingGpio::default();
        let mut channel = relay(1_000).with_analog(true);

        channel.write(300, 0, &mut gpio);
        channel.write(900, 100, &mut gpio);
        channel.revert(1_100, &mut gpio);

        assert_eq!(channel.state(), 300);
        assert_eq!(channel.revert_deadline_ms(), None);
    }

    #[test]
    fn inversion_applies_only_at_the_pin() {
        let mut gpio = RecordingGpio::default();
        let mut channel = relay(0).with_inverted(true);

        channel.write(1, 0, &mut gpio);

        assert_eq!(channel.state(), 1);
        assert_eq!(gpio.writes, vec![(5, 0)]);
    }

    #[test]
    fn analog_values_are_clamped() {
        let mut gpio = RecordingGpio::default();
        let mut channel = relay(0).with_analog(true);

        channel.write(5_000, 0, &mut gpio);

        assert_eq!(channel.state(), ANALOG_MAX);
    }

    #[test]
    fn input_sampling_is_rate_limited() {
        let mut gpio = RecordingGpio::default();
        let mut channel = Channel::new("door", "door", 4, Direction::Input).with_timer_ms(500);
        gpio.levels.insert(4, 1);

        assert!(channel.read(0, &mut gpio));
        assert_eq!(channel.state(), 1);
        assert!(!channel.read(499, &mut gpio));
        assert!(channel.read(500, &mut gpio));
        assert!(!channel.time_is_up(10_000));
    }

    #[test]
    fn setters_are_idempotent_reporters() {
        let mut channel = relay(0);

        assert!(!channel.rename("lamp"));
        assert!(channel.rename("Lamp"));
        assert!(!channel.set_enabled(true));
        assert!(channel.set_enabled(false));
        assert!(!channel.set_timer(0));
        assert!(channel.set_timer(30_000));
    }

    #[test]
    fn rename_is_bounded() {
        let mut channel = relay(0);

        channel.rename("a name that is far too long for the buffer");

        assert_eq!(channel.name(), "a name that is far t");
        assert!(!channel.rename("a name that is far too long for the buffer"));
    }

    #[test]
    fn default_property_follows_channel_mode() {
        let output = relay(0);
        let input = Channel::new("level", "tank", 34, Direction::Input).with_analog(true);

        assert_eq!(output.property().datatype, "boolean");
        assert!(output.property().settable);
        assert_eq!(input.property().datatype, "integer");
        assert!(!input.property().settable);
        assert!(input.property().retained);
    }

    #[test]
    fn registry_rejects_overflow_and_duplicates() {
        let mut registry = ChannelRegistry::new();
        for index in 0..MAX_CHANNELS {
            let id = format!("ch{index}");
            assert_eq!(
                registry.add(Channel::new(&id, &id, index as u8, Direction::Output)),
                Ok(index)
            );
        }

        assert_eq!(
            registry.add(Channel::new("ch0", "dup", 9, Direction::Output)),
            Err(RegistryError::DuplicateId)
        );
        assert_eq!(
            registry.add(Channel::new("extra", "extra", 9, Direction::Output)),
            Err(RegistryError::Full {
                capacity: MAX_CHANNELS
            })
        );
        assert_eq!(registry.len(), MAX_CHANNELS);
        assert_eq!(registry.get(0).map(Channel::id), Some("ch0"));
    }
}
