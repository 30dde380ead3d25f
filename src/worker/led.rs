//! LED strands driven by the worker process
//!
//! A [`LedController`] owns one [`Strand`] per configured strand. Each
//! strand renders its animation into a pixel buffer and hands the buffer
//! to a [`PixelDriver`]. The shipped [`LoggingDriver`] only traces frames;
//! hardware drivers plug in through the same trait.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use super::command::{AnimationKind, WorkerCommand};
use crate::config::{LedConfig, StrandConfig};
use crate::error::Result;

pub type Rgb = [u8; 3];

/// Slowest allowed step time in seconds
pub const MAX_SPEED: f64 = 0.1;
/// Fastest allowed step time in seconds
pub const MIN_SPEED: f64 = 0.001;
pub const DEFAULT_SPEED: f64 = 0.025;
pub const DEFAULT_COLOR: Rgb = [255, 255, 255];

/// Consecutive driver failures before a strand is disabled
const MAX_DRIVER_ERRORS: u32 = 5;

const CHASE_SIZE: usize = 5;
const CHASE_SPACING: usize = 3;
const COMET_TAIL: usize = 12;
const SPARKLE_COUNT: usize = 15;

/// Animation step time for a local people count
///
/// More people make the animation faster.
pub fn speed_for_people(count: u32) -> f64 {
    match count {
        0 => 0.050,
        1 => 0.025,
        2 => 0.015,
        3 => 0.010,
        _ => 0.005,
    }
}

/// Whether `hour` falls inside the `[start, end)` window
///
/// A window with `start > end` wraps midnight, so `(19, 7)` covers the
/// night. `(0, 24)` is always active.
pub fn is_active_hour(hour: u32, (start, end): (u8, u8)) -> bool {
    let (start, end) = (start as u32, end as u32);
    if start > end {
        hour >= start || hour < end
    } else {
        start <= hour && hour < end
    }
}

/// Sink for rendered pixel frames
pub trait PixelDriver: Send {
    fn write(&mut self, pixels: &[Rgb]) -> Result<()>;
}

/// Driver that traces frames instead of transmitting them
pub struct LoggingDriver {
    pin: String,
    frames: u64,
}

impl LoggingDriver {
    pub fn new(pin: impl Into<String>) -> Self {
        Self {
            pin: pin.into(),
            frames: 0,
        }
    }
}

impl PixelDriver for LoggingDriver {
    fn write(&mut self, pixels: &[Rgb]) -> Result<()> {
        self.frames += 1;
        let lit = pixels.iter().filter(|p| **p != [0, 0, 0]).count();
        trace!(pin = %self.pin, frame = self.frames, lit, "LED frame");
        Ok(())
    }
}

/// Builds the driver for a strand
pub type DriverFactory = dyn Fn(&StrandConfig) -> Result<Box<dyn PixelDriver>>;

/// Color wheel: 0..=255 walks red -> green -> blue -> red
fn wheel(pos: u8) -> Rgb {
    let pos = pos as u16;
    match pos {
        0..=84 => [(255 - pos * 3) as u8, (pos * 3) as u8, 0],
        85..=169 => {
            let p = pos - 85;
            [0, (255 - p * 3) as u8, (p * 3) as u8]
        }
        _ => {
            let p = pos - 170;
            [(p * 3) as u8, 0, (255 - p * 3) as u8]
        }
    }
}

fn scale(color: Rgb, level: u8) -> Rgb {
    let s = |c: u8| ((c as u16 * level as u16) / 255) as u8;
    [s(color[0]), s(color[1]), s(color[2])]
}

/// Animation state for one strand
#[derive(Debug, Clone)]
pub struct Animation {
    kind: AnimationKind,
    speed: f64,
    color: Rgb,
    step: u64,
    last_step: Option<Instant>,
}

impl Animation {
    pub fn new(kind: AnimationKind, speed: f64, color: Rgb) -> Self {
        Self {
            kind,
            speed,
            color,
            step: 0,
            last_step: None,
        }
    }

    pub fn kind(&self) -> AnimationKind {
        self.kind
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Render the next step into `pixels` if one is due at `now`
    pub fn render(&mut self, now: Instant, pixels: &mut [Rgb]) -> bool {
        if let Some(last) = self.last_step {
            if now.duration_since(last) < Duration::from_secs_f64(self.speed) {
                return false;
            }
        }
        self.last_step = Some(now);

        let n = pixels.len();
        if n > 0 {
            match self.kind {
                AnimationKind::Rainbow => self.rainbow(pixels, 255),
                AnimationKind::RainbowChase => {
                    let offset = self.step as usize % (CHASE_SIZE + CHASE_SPACING);
                    let color = wheel((self.step * 8 % 256) as u8);
                    for (i, px) in pixels.iter_mut().enumerate() {
                        let lit = (i + offset) % (CHASE_SIZE + CHASE_SPACING) < CHASE_SIZE;
                        *px = if lit { color } else { [0, 0, 0] };
                    }
                }
                AnimationKind::RainbowComet => self.comet(pixels),
                AnimationKind::RainbowSparkle => {
                    self.rainbow(pixels, 64);
                    let mut rng = rand::thread_rng();
                    for _ in 0..SPARKLE_COUNT.min(n) {
                        let i = rng.gen_range(0..n);
                        pixels[i] = wheel((i * 256 / n) as u8);
                    }
                }
                AnimationKind::SparklePulse => {
                    // Triangle wave over 64 steps
                    let phase = (self.step % 64) as i32;
                    let level = (255 - (phase - 32).abs() * 8).clamp(0, 255) as u8;
                    pixels.fill(scale(self.color, level / 4));
                    let i = rand::thread_rng().gen_range(0..n);
                    pixels[i] = self.color;
                }
                AnimationKind::Solid => pixels.fill(self.color),
            }
        }

        self.step = self.step.wrapping_add(1);
        true
    }

    fn rainbow(&self, pixels: &mut [Rgb], level: u8) {
        let n = pixels.len();
        for (i, px) in pixels.iter_mut().enumerate() {
            let pos = (i * 256 / n) as u64 + self.step * 4;
            *px = scale(wheel((pos % 256) as u8), level);
        }
    }

    fn comet(&self, pixels: &mut [Rgb]) {
        let n = pixels.len();
        // Head bounces between both ends
        let span = ((n - 1) * 2).max(1);
        let pos = self.step as usize % span;
        let (head, forward) = if pos < n { (pos, true) } else { (span - pos, false) };

        pixels.fill([0, 0, 0]);
        for t in 0..COMET_TAIL.min(n) {
            let idx = if forward {
                head.checked_sub(t)
            } else {
                Some(head + t).filter(|i| *i < n)
            };
            let Some(idx) = idx else { break };
            let level = (255 - t * 255 / COMET_TAIL) as u8;
            pixels[idx] = scale(wheel(((idx * 256 / n) % 256) as u8), level);
        }
    }
}

/// One LED strand
pub struct Strand {
    name: String,
    responds_to_people: bool,
    active: bool,
    disabled: bool,
    errors: u32,
    animation: Animation,
    pixels: Vec<Rgb>,
    driver: Box<dyn PixelDriver>,
}

impl Strand {
    pub fn new(config: &StrandConfig, driver: Box<dyn PixelDriver>) -> Self {
        Self {
            name: config.name.clone(),
            responds_to_people: config.responds_to_people,
            active: false,
            disabled: false,
            errors: 0,
            animation: Animation::new(config.animation, DEFAULT_SPEED, DEFAULT_COLOR),
            pixels: vec![[0, 0, 0]; config.pixels as usize],
            driver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn animation(&self) -> &Animation {
        &self.animation
    }

    pub fn pixels(&self) -> &[Rgb] {
        &self.pixels
    }

    pub fn set_active(&mut self, active: bool) {
        if self.disabled {
            return;
        }
        self.active = active;
        if !active {
            self.turn_off();
        }
    }

    /// Set the step time, clamped to the supported range
    pub fn set_speed(&mut self, speed: f64) {
        let speed = speed.clamp(MIN_SPEED, MAX_SPEED);
        if self.animation.speed != speed {
            self.animation.speed = speed;
            debug!("Set strand '{}' speed to {}", self.name, speed);
        }
    }

    /// Set the color used by color-based animations
    pub fn set_color(&mut self, color: Rgb) {
        self.animation.color = color;
        if self.animation.kind.uses_color() {
            debug!("Set strand '{}' color to {:?}", self.name, color);
        }
    }

    pub fn set_animation(&mut self, kind: AnimationKind) {
        if self.animation.kind != kind {
            self.animation = Animation::new(kind, self.animation.speed, self.animation.color);
            debug!("Set strand '{}' animation to {:?}", self.name, kind);
        }
    }

    pub fn turn_off(&mut self) {
        self.pixels.fill([0, 0, 0]);
        if self.disabled {
            return;
        }
        if let Err(e) = self.driver.write(&self.pixels) {
            error!("Error turning off strand '{}': {}", self.name, e);
        }
    }

    /// Render and transmit one step; returns whether a frame was written
    pub fn animate(&mut self, now: Instant) -> bool {
        if self.disabled || !self.active {
            return false;
        }
        if !self.animation.render(now, &mut self.pixels) {
            return false;
        }

        match self.driver.write(&self.pixels) {
            Ok(()) => {
                self.errors = 0;
                true
            }
            Err(e) => {
                self.errors += 1;
                error!(
                    "Error animating strand '{}' (count: {}): {}",
                    self.name, self.errors, e
                );
                if self.errors >= MAX_DRIVER_ERRORS {
                    self.disabled = true;
                    self.active = false;
                    warn!("Disabling strand '{}' due to repeated errors", self.name);
                }
                false
            }
        }
    }
}

/// Outcome of applying a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// All strands plus the activation and active-hours gates
pub struct LedController {
    strands: Vec<Strand>,
    active_hours: (u8, u8),
    activated: bool,
    in_hours: bool,
    people_count: Option<u32>,
}

impl LedController {
    pub fn new(config: &LedConfig, factory: &DriverFactory) -> Result<Self> {
        let strands = config
            .strands
            .iter()
            .map(|s| {
                info!("Strand '{}' on {} with {} pixels", s.name, s.pin, s.pixels);
                Ok(Strand::new(s, factory(s)?))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            strands,
            active_hours: config.active_hours,
            activated: false,
            in_hours: true,
            people_count: None,
        })
    }

    /// Controller whose strands all log through [`LoggingDriver`]
    pub fn with_logging_drivers(config: &LedConfig) -> Result<Self> {
        Self::new(config, &|s: &StrandConfig| {
            Ok(Box::new(LoggingDriver::new(s.pin.clone())) as Box<dyn PixelDriver>)
        })
    }

    pub fn strand(&self, name: &str) -> Option<&Strand> {
        self.strands.iter().find(|s| s.name == name)
    }

    fn strand_mut(&mut self, name: &str) -> Option<&mut Strand> {
        let strand = self.strands.iter_mut().find(|s| s.name == name);
        if strand.is_none() {
            warn!("Unknown strand '{}'", name);
        }
        strand
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    /// Activated by the parent and inside the active hours
    pub fn should_animate(&self) -> bool {
        self.activated && self.in_hours
    }

    pub fn apply(&mut self, command: WorkerCommand) -> Flow {
        trace!(command = command.name(), "Applying command");
        match command {
            WorkerCommand::SetAllActive { active } => self.set_all_active(active),
            WorkerCommand::SetPeripheralActive { strand, active } => {
                if let Some(s) = self.strand_mut(&strand) {
                    s.set_active(active);
                }
            }
            WorkerCommand::SetAnimation { strand, animation } => {
                if let Some(s) = self.strand_mut(&strand) {
                    s.set_animation(animation);
                }
            }
            WorkerCommand::SetSpeed { strand, speed } => {
                if let Some(s) = self.strand_mut(&strand) {
                    s.set_speed(speed);
                }
            }
            WorkerCommand::SetColor { strand, color } => {
                if let Some(s) = self.strand_mut(&strand) {
                    s.set_color(color);
                }
            }
            WorkerCommand::SetPeopleCount { count } => self.set_people_count(count),
            WorkerCommand::TurnOffAll => self.turn_off_all(),
            WorkerCommand::Shutdown => return Flow::Shutdown,
        }
        Flow::Continue
    }

    pub fn set_all_active(&mut self, active: bool) {
        self.activated = active;
        for strand in &mut self.strands {
            strand.set_active(active);
        }
        info!("LEDs {}", if active { "activated" } else { "deactivated" });
    }

    /// Adjust responsive strands to the local people count
    pub fn set_people_count(&mut self, count: u32) {
        if self.people_count == Some(count) {
            return;
        }
        self.people_count = Some(count);
        let speed = speed_for_people(count);
        for strand in self.strands.iter_mut().filter(|s| s.responds_to_people) {
            strand.set_speed(speed);
        }
        info!("Updated LED speed for {} local people", count);
    }

    /// Re-evaluate the active-hours window; darkens the strands on leaving it
    pub fn update_hours(&mut self, hour: u32) {
        let in_hours = is_active_hour(hour, self.active_hours);
        if in_hours == self.in_hours {
            return;
        }
        self.in_hours = in_hours;
        if in_hours {
            info!("Entering active hours at {}:00", hour);
        } else {
            info!("Outside active hours at {}:00, turning LEDs off", hour);
            for strand in &mut self.strands {
                strand.turn_off();
            }
        }
    }

    /// Step every strand; returns the number of frames written
    pub fn animate_all(&mut self, now: Instant) -> usize {
        if !self.should_animate() {
            return 0;
        }
        self.strands.iter_mut().filter(|s| s.is_active()).fold(0, |n, s| {
            n + s.animate(now) as usize
        })
    }

    pub fn turn_off_all(&mut self) {
        for strand in &mut self.strands {
            strand.turn_off();
        }
        debug!("All strands turned off");
    }
}
