/// Bounded rolling series backing the chart

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::time::Duration;

use crate::core::DataPoint;

#[derive(Debug, Clone)]
pub struct RollingSeries {
    points: VecDeque<DataPoint>,
    capacity: usize,
}

impl RollingSeries {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest point when full.
    pub fn push(&mut self, point: DataPoint) -> Option<DataPoint> {
        let evicted = if self.points.len() >= self.capacity {
            self.points.pop_front()
        } else {
            None
        };
        self.points.push_back(point);
        evicted
    }

    /// Replace the contents with `capacity` zero-score placeholders, oldest
    /// first, the newest one `spacing` before `now`.
    pub fn seed_placeholders(&mut self, now: DateTime<Local>, spacing: Duration) {
        let spacing = chrono::Duration::from_std(spacing).unwrap_or_else(|_| chrono::Duration::seconds(1));
        self.points.clear();
        for steps_back in (1..=self.capacity as i32).rev() {
            self.points.push_back(DataPoint::placeholder(now - spacing * steps_back));
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&DataPoint> {
        self.points.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataPoint> {
        self.points.iter()
    }

    pub fn to_vec(&self) -> Vec<DataPoint> {
        self.points.iter().cloned().collect()
    }
}
