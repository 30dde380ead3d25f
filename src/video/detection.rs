//! People counting over object detector output

/// COCO class id for "person"
pub const PERSON_CLASS_ID: u32 = 0;

/// One detector result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub score: f32,
}

impl Detection {
    pub fn new(class_id: u32, score: f32) -> Self {
        Self { class_id, score }
    }
}

/// Count detections that are people scoring strictly above `threshold`
pub fn count_people(detections: &[Detection], threshold: f32) -> u32 {
    detections
        .iter()
        .filter(|d| d.class_id == PERSON_CLASS_ID && d.score > threshold)
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_people() {
        let detections = [
            Detection::new(0, 0.9),
            Detection::new(0, 0.55),
            Detection::new(0, 0.3),
            Detection::new(2, 0.99),
            Detection::new(0, 0.56),
        ];
        assert_eq!(count_people(&detections, 0.55), 2);
        assert_eq!(count_people(&[], 0.55), 0);
    }
}
