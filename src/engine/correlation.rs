//! Per-frame orchestration around the correlation collaborator.

use super::exchange::CommittedFrame;
use crate::devices::capture::FramePair;
use crate::devices::dic::{Correlator, Field, StereoGeometry};
use crate::model::SubsetRecord;
use anyhow::{Context, Result};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOutcome {
    pub index: u64,
    pub failed: bool,
}

pub struct CorrelationStep {
    correlator: Box<dyn Correlator>,
    incremental: bool,
}

impl CorrelationStep {
    pub fn new(correlator: Box<dyn Correlator>, incremental: bool) -> Self {
        Self {
            correlator,
            incremental,
        }
    }

    /// Set up the reference and read the subset layout. Errors here are
    /// configuration problems and abort the arm.
    pub fn initialize(
        &mut self,
        reference: &FramePair,
        geometry: Option<StereoGeometry>,
    ) -> Result<Vec<SubsetRecord>> {
        let (width, height) = reference.dimensions();
        self.correlator
            .update_roi(width, height)
            .context("correlation region of interest")?;
        self.correlator.set_stereo_geometry(geometry);
        self.correlator
            .set_reference(reference)
            .context("correlation reference")?;
        let subsets = (0..self.correlator.local_num_subsets())
            .map(|i| {
                SubsetRecord::new(
                    i,
                    self.correlator.local_field_value(i, Field::CoordinateX),
                    self.correlator.local_field_value(i, Field::CoordinateY),
                    self.correlator.subset_size(i),
                )
            })
            .collect();
        Ok(subsets)
    }

    /// Correlate one committed frame and refresh `subsets` in place. A
    /// collaborator error counts as a failed frame.
    pub fn run(&mut self, frame: &CommittedFrame, subsets: &mut [SubsetRecord]) -> FrameOutcome {
        let failed = match self.correlate(frame, subsets) {
            Ok(failed) => failed,
            Err(e) => {
                warn!(index = frame.index, error = %format!("{e:#}"), "correlation error");
                true
            }
        };
        debug!(index = frame.index, failed, "frame correlated");
        FrameOutcome {
            index: frame.index,
            failed,
        }
    }

    fn correlate(&mut self, frame: &CommittedFrame, subsets: &mut [SubsetRecord]) -> Result<bool> {
        let (width, height) = frame.pair.dimensions();
        self.correlator.update_roi(width, height)?;
        self.correlator.set_deformed(&frame.pair)?;
        let failed = self.correlator.execute_correlation();
        self.correlator.execute_triangulation()?;
        self.correlator.execute_post_processors()?;
        self.correlator.write_output(frame.index)?;

        let c = &self.correlator;
        for s in subsets.iter_mut() {
            s.displacement_x = c.local_field_value(s.index, Field::DisplacementX);
            s.displacement_y = c.local_field_value(s.index, Field::DisplacementY);
            s.displacement_z = c.local_field_value(s.index, Field::DisplacementZ);
        }

        if self.incremental {
            self.correlator.set_reference(&frame.pair)?;
        }
        Ok(failed)
    }
}
