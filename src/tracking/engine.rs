//! Tracking decision engine - turns detection frames into debounced motion commands

use crate::error::CoordinatorError;
use robofleet_shared::{tracking, Command, DetectedObject, DetectionFrame};
use tracing::debug;

/// Configuration for person tracking
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Camera image is mirrored (front-facing camera looking at the subject).
    ///
    /// Mirrored: subject left of center in the image -> RIGHT, right of center -> LEFT.
    /// Not mirrored: left of center -> LEFT, right of center -> RIGHT.
    pub mirrored: bool,
    /// Consecutive empty frames before STOP is forced
    pub empty_frame_threshold: u32,
    /// Dead zone half-width is `frame_width / tolerance_divisor`
    pub tolerance_divisor: u32,
    /// Height/width band for unlabeled objects
    pub min_aspect: f32,
    pub max_aspect: f32,
    /// Minimum box area as a fraction of frame area for unlabeled objects
    pub min_area_fraction: f32,
    /// Case-insensitive label fragments that mark a person
    pub person_labels: Vec<String>,
    /// Log a diagnostic line every N frames
    pub diagnostic_interval: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            mirrored: true,
            empty_frame_threshold: tracking::EMPTY_FRAME_THRESHOLD,
            tolerance_divisor: tracking::CENTER_TOLERANCE_DIVISOR,
            min_aspect: tracking::MIN_PERSON_ASPECT,
            max_aspect: tracking::MAX_PERSON_ASPECT,
            min_area_fraction: tracking::MIN_PERSON_AREA_FRACTION,
            person_labels: tracking::PERSON_LABELS.iter().map(|s| s.to_string()).collect(),
            diagnostic_interval: tracking::DIAGNOSTIC_INTERVAL,
        }
    }
}

/// Converts detection frames into motion commands for one session
#[derive(Debug)]
pub struct TrackingDecisionEngine {
    config: TrackingConfig,
    last_command: Option<Command>,
    consecutive_empty_frames: u32,
    frames_seen: u64,
}

impl TrackingDecisionEngine {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            last_command: None,
            consecutive_empty_frames: 0,
            frames_seen: 0,
        }
    }

    pub fn last_command(&self) -> Option<Command> {
        self.last_command
    }

    pub fn consecutive_empty_frames(&self) -> u32 {
        self.consecutive_empty_frames
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Observe one frame; returns a command only when it differs from the last one emitted
    pub fn observe(&mut self, frame: &DetectionFrame) -> Option<Command> {
        match self.try_observe(frame) {
            Ok(command) => command,
            Err(e) => {
                debug!("Skipping frame: {}", e);
                None
            }
        }
    }

    /// Like `observe`, but reports malformed frames instead of swallowing them
    pub fn try_observe(&mut self, frame: &DetectionFrame) -> Result<Option<Command>, CoordinatorError> {
        if frame.is_malformed() {
            return Err(CoordinatorError::MalformedFrame {
                width: frame.width,
                height: frame.height,
            });
        }

        self.frames_seen += 1;
        if self.config.diagnostic_interval > 0 && self.frames_seen % self.config.diagnostic_interval == 0 {
            debug!(
                "Frame #{} ({}x{}), {} objects, last={:?}",
                self.frames_seen,
                frame.width,
                frame.height,
                frame.objects.len(),
                self.last_command
            );
        }

        let target = self.largest_person(frame);

        let Some(target) = target else {
            self.consecutive_empty_frames = self.consecutive_empty_frames.saturating_add(1);
            if self.consecutive_empty_frames >= self.config.empty_frame_threshold
                && self.last_command != Some(Command::Stop)
            {
                return Ok(self.emit(Command::Stop));
            }
            return Ok(None);
        };

        self.consecutive_empty_frames = 0;
        let command = self.steer(target.bounds.center_x(), frame.width);

        if self.last_command == Some(command) {
            return Ok(None);
        }
        Ok(self.emit(command))
    }

    fn emit(&mut self, command: Command) -> Option<Command> {
        self.last_command = Some(command);
        Some(command)
    }

    /// Largest person-like object; ties keep the first seen
    fn largest_person<'a>(&self, frame: &'a DetectionFrame) -> Option<&'a DetectedObject> {
        let mut best: Option<&DetectedObject> = None;
        for object in frame.objects.iter().filter(|o| self.is_person(o, frame)) {
            if best.map_or(true, |b| object.bounds.area() > b.bounds.area()) {
                best = Some(object);
            }
        }
        best
    }

    fn is_person(&self, object: &DetectedObject, frame: &DetectionFrame) -> bool {
        let mut usable = object.labels.iter().filter(|l| l.is_usable()).peekable();

        if usable.peek().is_some() {
            return usable.any(|label| {
                let text = label.text.to_lowercase();
                self.config
                    .person_labels
                    .iter()
                    .any(|p| text.contains(&p.to_lowercase()))
            });
        }

        let Some(aspect) = object.bounds.aspect_ratio() else {
            return false;
        };
        let area_fraction = object.bounds.area() as f64 / frame.area() as f64;

        aspect >= self.config.min_aspect
            && aspect <= self.config.max_aspect
            && area_fraction > f64::from(self.config.min_area_fraction)
    }

    fn steer(&self, center_x: i32, frame_width: u32) -> Command {
        let frame_center = (frame_width / 2) as i64;
        let tolerance = (frame_width / self.config.tolerance_divisor.max(1)) as i64;
        let center_x = i64::from(center_x);

        let (left_of_center, right_of_center) = if self.config.mirrored {
            (Command::Right, Command::Left)
        } else {
            (Command::Left, Command::Right)
        };

        if center_x < frame_center - tolerance {
            left_of_center
        } else if center_x > frame_center + tolerance {
            right_of_center
        } else {
            Command::Forward
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robofleet_shared::BoundingBox;

    const W: u32 = 640;
    const H: u32 = 480;

    fn engine(mirrored: bool) -> TrackingDecisionEngine {
        TrackingDecisionEngine::new(TrackingConfig {
            mirrored,
            ..Default::default()
        })
    }

    /// A labeled person box whose horizontal center is `center_x`
    fn person_at(center_x: i32) -> DetectedObject {
        DetectedObject::new(BoundingBox::new(center_x - 40, 100, 80, 200)).with_label("Person", 0.9)
    }

    fn frame(objects: Vec<DetectedObject>) -> DetectionFrame {
        DetectionFrame::new(W, H, objects)
    }

    #[test]
    fn test_stop_after_exactly_ten_empty_frames() {
        let mut e = engine(true);
        for i in 1..=9 {
            assert_eq!(e.observe(&frame(vec![])), None, "frame {}", i);
        }
        assert_eq!(e.observe(&frame(vec![])), Some(Command::Stop));
        for _ in 0..20 {
            assert_eq!(e.observe(&frame(vec![])), None);
        }
    }

    #[test]
    fn test_momentary_miss_holds_last_command() {
        let mut e = engine(true);
        assert_eq!(e.observe(&frame(vec![person_at(320)])), Some(Command::Forward));
        for _ in 0..9 {
            assert_eq!(e.observe(&frame(vec![])), None);
        }
        assert_eq!(e.observe(&frame(vec![person_at(320)])), None);
        assert_eq!(e.consecutive_empty_frames(), 0);
    }

    #[test]
    fn test_centered_subject_goes_forward_in_both_conventions() {
        for mirrored in [true, false] {
            let mut e = engine(mirrored);
            assert_eq!(
                e.observe(&frame(vec![person_at((W / 2) as i32)])),
                Some(Command::Forward)
            );
        }
    }

    #[test]
    fn test_mirrored_left_edge_turns_right() {
        let mut e = engine(true);
        let subject = DetectedObject::new(BoundingBox::new(0, 100, 0, 200)).with_label("person", 0.8);
        assert_eq!(subject.bounds.center_x(), 0);
        assert_eq!(e.observe(&frame(vec![subject])), Some(Command::Right));
    }

    #[test]
    fn test_unmirrored_mapping() {
        let mut e = engine(false);
        assert_eq!(e.observe(&frame(vec![person_at(10)])), Some(Command::Left));
        assert_eq!(e.observe(&frame(vec![person_at(630)])), Some(Command::Right));
    }

    #[test]
    fn test_tolerance_boundary() {
        // 640 / 6 = 106, so the dead zone is [214, 426]
        let mut e = engine(true);
        assert_eq!(e.observe(&frame(vec![person_at(214)])), Some(Command::Forward));
        assert_eq!(e.observe(&frame(vec![person_at(213)])), Some(Command::Right));
        assert_eq!(e.observe(&frame(vec![person_at(427)])), Some(Command::Left));
        assert_eq!(e.observe(&frame(vec![person_at(426)])), Some(Command::Forward));
    }

    #[test]
    fn test_repeated_command_is_suppressed() {
        let mut e = engine(true);
        assert_eq!(e.observe(&frame(vec![person_at(50)])), Some(Command::Right));
        assert_eq!(e.observe(&frame(vec![person_at(60)])), None);
        assert_eq!(e.last_command(), Some(Command::Right));
    }

    #[test]
    fn test_largest_person_wins_and_ties_keep_first() {
        let mut e = engine(false);
        let small_left = DetectedObject::new(BoundingBox::new(0, 0, 40, 100)).with_label("person", 0.9);
        let big_right = DetectedObject::new(BoundingBox::new(560, 0, 80, 200)).with_label("person", 0.9);
        assert_eq!(
            e.observe(&frame(vec![small_left, big_right])),
            Some(Command::Right)
        );

        let mut e = engine(false);
        let a = DetectedObject::new(BoundingBox::new(0, 0, 80, 200)).with_label("woman", 0.9);
        let b = DetectedObject::new(BoundingBox::new(560, 0, 80, 200)).with_label("man", 0.9);
        assert_eq!(e.observe(&frame(vec![a, b])), Some(Command::Left));
    }

    #[test]
    fn test_non_person_labels_are_ignored() {
        let mut e = engine(true);
        let chair = DetectedObject::new(BoundingBox::new(280, 100, 80, 200)).with_label("Chair", 0.95);
        assert_eq!(e.observe(&frame(vec![chair])), None);
        assert_eq!(e.consecutive_empty_frames(), 1);
    }

    #[test]
    fn test_label_match_is_substring_and_case_insensitive() {
        let mut e = engine(true);
        let obj = DetectedObject::new(BoundingBox::new(280, 0, 80, 80)).with_label("Human face", 0.4);
        assert_eq!(e.observe(&frame(vec![obj])), Some(Command::Forward));
    }

    #[test]
    fn test_unlabeled_box_heuristic() {
        let mut e = engine(true);

        // aspect 2.5, area 80*200 = 16000 > 1% of 307200
        let tall = DetectedObject::new(BoundingBox::new(280, 0, 80, 200));
        assert_eq!(e.observe(&frame(vec![tall])), Some(Command::Forward));

        let mut e = engine(true);
        // too wide
        let wide = DetectedObject::new(BoundingBox::new(280, 0, 200, 80));
        // tall enough but tiny
        let tiny = DetectedObject::new(BoundingBox::new(300, 0, 10, 20));
        // blank labels fall back to the heuristic too
        let blank = DetectedObject::new(BoundingBox::new(300, 0, 10, 20)).with_label("  ", 0.9);
        assert_eq!(e.observe(&frame(vec![wide, tiny, blank])), None);
    }

    #[test]
    fn test_malformed_frame_changes_nothing() {
        let mut e = engine(true);
        for _ in 0..9 {
            e.observe(&frame(vec![]));
        }

        let bad = DetectionFrame::new(0, H, vec![]);
        assert!(matches!(
            e.try_observe(&bad),
            Err(CoordinatorError::MalformedFrame { width: 0, .. })
        ));
        assert_eq!(e.observe(&DetectionFrame::new(W, 0, vec![])), None);
        assert_eq!(e.consecutive_empty_frames(), 9);
        assert_eq!(e.frames_seen(), 9);

        assert_eq!(e.observe(&frame(vec![])), Some(Command::Stop));
    }
}
