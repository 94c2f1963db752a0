//! Slot profiles bit-packed into one integer
//!
//! Slot `k` sits at bit `k * (speed_bits + duration_bits)`: the speed in the low bits, the
//! duration (in steps) above it. A speed of 0 is "off" and terminates the profile, so nothing
//! after it is encoded.

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    #[error("{given} slots given, the layout has {max}")]
    TooManySlots { given: usize, max: usize },
    #[error("slot {slot}: speed {speed} is out of range (max {max})")]
    SpeedOutOfRange { slot: usize, speed: u8, max: u8 },
    #[error("slot {slot}: duration {duration}s is out of range (max {max}s)")]
    DurationOutOfRange { slot: usize, duration: u32, max: u32 },
    /// `bits` saturates at `u32::MAX`
    #[error("layout needs {bits} bits")]
    LayoutTooWide { bits: u32 },
    #[error("speeds wider than 8 bits are not supported ({bits} given)")]
    SpeedTooWide { bits: u32 },
    #[error("duration step must be at least 1s")]
    ZeroStep,
    #[error("{max_steps} steps of {step}s do not fit a u32 of seconds")]
    DurationOverflow { max_steps: u64, step: u32 },
}

/// Bit layout of a slot profile. Only constructible through [`SlotLayout::new`], so every
/// layout fits a `u32` and its longest duration fits a `u32` of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    slots: usize,
    speed_bits: u32,
    duration_bits: u32,
    /// Seconds per duration unit
    duration_step: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot {
    pub speed: u8,
    /// Seconds
    pub duration: u32,
}

impl Slot {
    pub const OFF: Slot = Slot { speed: 0, duration: 0 };

    pub fn new(speed: u8, duration: u32) -> Self {
        Self { speed, duration }
    }

    pub fn is_off(&self) -> bool {
        self.speed == 0
    }
}

impl SlotLayout {
    /// Fan "breeze" profile: five slots of a 2-bit speed and a 4-bit duration in 5 s steps
    pub const BREEZE: SlotLayout = SlotLayout {
        slots: 5,
        speed_bits: 2,
        duration_bits: 4,
        duration_step: 5,
    };

    pub fn new(slots: usize, speed_bits: u32, duration_bits: u32, duration_step: u32) -> Result<Self, PackError> {
        let bits = speed_bits
            .checked_add(duration_bits)
            .zip(u32::try_from(slots).ok())
            .and_then(|(slot_bits, slots)| slot_bits.checked_mul(slots));

        match bits {
            Some(bits) if bits <= u32::BITS => {}
            bits => return Err(PackError::LayoutTooWide { bits: bits.unwrap_or(u32::MAX) }),
        }

        if speed_bits > u8::BITS {
            return Err(PackError::SpeedTooWide { bits: speed_bits });
        }

        if duration_step == 0 {
            return Err(PackError::ZeroStep);
        }

        let max_steps = mask(duration_bits);
        if max_steps
            .checked_mul(u64::from(duration_step))
            .is_none_or(|max| max > u64::from(u32::MAX))
        {
            return Err(PackError::DurationOverflow { max_steps, step: duration_step });
        }

        Ok(Self { slots, speed_bits, duration_bits, duration_step })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn duration_step(&self) -> u32 {
        self.duration_step
    }

    fn slot_bits(&self) -> u32 {
        self.speed_bits + self.duration_bits
    }

    pub fn max_speed(&self) -> u8 {
        mask(self.speed_bits) as u8
    }

    /// Longest duration in seconds a slot can hold
    pub fn max_duration(&self) -> u32 {
        (mask(self.duration_bits) * u64::from(self.duration_step)) as u32
    }

    fn check(&self, slots: &[Slot]) -> Result<(), PackError> {
        if slots.len() > self.slots {
            return Err(PackError::TooManySlots { given: slots.len(), max: self.slots });
        }

        for (slot, &Slot { speed, duration }) in slots.iter().enumerate() {
            if speed > self.max_speed() {
                return Err(PackError::SpeedOutOfRange { slot, speed, max: self.max_speed() });
            }

            if duration > self.max_duration() {
                return Err(PackError::DurationOutOfRange {
                    slot,
                    duration,
                    max: self.max_duration(),
                });
            }
        }

        Ok(())
    }

    /// Durations are floored to the step. Slots after the first "off" one are not encoded.
    pub fn encode(&self, slots: &[Slot]) -> Result<u32, PackError> {
        self.check(slots)?;

        let mut packed = 0u64;
        for (k, slot) in slots.iter().enumerate() {
            let offset = k as u32 * self.slot_bits();
            let steps = slot.duration / self.duration_step;

            packed |= u64::from(slot.speed) << offset;
            packed |= u64::from(steps) << (offset + self.speed_bits);

            if slot.is_off() {
                break;
            }
        }

        Ok(packed as u32)
    }

    /// Every slot of the layout; slots after the first "off" one carry no meaning
    pub fn decode(&self, packed: u32) -> Vec<Slot> {
        let packed = u64::from(packed);

        (0..self.slots)
            .map(|k| {
                let offset = k as u32 * self.slot_bits();
                let speed = (packed >> offset) & mask(self.speed_bits);
                let steps = (packed >> (offset + self.speed_bits)) & mask(self.duration_bits);

                Slot {
                    speed: speed as u8,
                    duration: (steps * u64::from(self.duration_step)) as u32,
                }
            })
            .collect()
    }

    /// Decoded slots up to and including the first "off" one
    pub fn decode_profile(&self, packed: u32) -> Vec<Slot> {
        let mut slots = self.decode(packed);
        if let Some(end) = slots.iter().position(Slot::is_off) {
            slots.truncate(end + 1);
        }
        slots
    }
}

/// Largest value of a `bits` wide field, `bits <= 32`
fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

kitsune_common::lookup! {
    pub enum BreezeSpeed {
        Off = 0 => "off",
        Low = 1 => "low",
        Medium = 2 => "medium",
        High = 3 => "high",
    }
}
