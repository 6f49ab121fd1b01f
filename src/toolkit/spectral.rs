//! Spectral-axis operations on the input cube: frame configuration,
//! velocity-range collapses, and 1 km/s resampling.

use crate::error::{PipelineError, Result};
use crate::toolkit::ToolkitRunner;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Collapse estimator applied along the velocity axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapseEstimator {
    /// Integrate intensity over the range: produces the moment-0 map.
    Integrate,
    /// Standard deviation over the range: produces the RMS map.
    Dispersion,
}

impl CollapseEstimator {
    /// Keyword the toolkit's collapse command expects.
    fn keyword(&self) -> &'static str {
        match self {
            Self::Integrate => "Integ",
            Self::Dispersion => "Sigma",
        }
    }
}

/// Runs the toolkit's spectral-axis commands for one cube.
pub struct SpectralStageRunner {
    toolkit: Arc<dyn ToolkitRunner>,
    timeout: Duration,
}

impl SpectralStageRunner {
    pub fn new(toolkit: Arc<dyn ToolkitRunner>, timeout: Duration) -> Self {
        Self { toolkit, timeout }
    }

    /// Fix the cube's spectral axis to radio velocity in the kinematic local
    /// standard of rest. Re-setting an already-correct frame is a no-op for
    /// the cube, so this is safe to issue on every non-skipped run. The
    /// `ndftrace` calls bracket the change so the before/after WCS appears
    /// in the captured output.
    pub async fn set_velocity_frame(&self, cube: &Path) -> Result<()> {
        let cube = cube.display();
        let command = format!(
            "ndftrace {cube}\n\
             wcsattrib ndf={cube} mode=set name=system newval=vrad\n\
             wcsattrib ndf={cube} mode=set name=StdofRest newval=LSRK\n\
             ndftrace {cube}"
        );
        self.toolkit.run(&command, self.timeout).await?;
        Ok(())
    }

    /// Collapse `cube` along the velocity axis over `range` with the given
    /// estimator, writing the result to `output`. A zero-width range is
    /// rejected before the toolkit is invoked.
    pub async fn collapse(
        &self,
        cube: &Path,
        range: [f64; 2],
        estimator: CollapseEstimator,
        output: &Path,
    ) -> Result<()> {
        let [low, high] = range;
        if low >= high {
            return Err(PipelineError::DegenerateRange { low, high });
        }

        let command = format!(
            "collapse in={} axis=vrad low={} high={} estimator={} out={}",
            cube.display(),
            low,
            high,
            estimator.keyword(),
            output.display(),
        );
        self.toolkit.run(&command, self.timeout).await?;
        Ok(())
    }

    /// Produce both velocity-range maps: the moment-0 map (integration) and
    /// the RMS map (dispersion), in that order.
    pub async fn make_maps(
        &self,
        cube: &Path,
        velocity_range: [f64; 2],
        moment0_out: &Path,
        rms_out: &Path,
    ) -> Result<()> {
        self.collapse(cube, velocity_range, CollapseEstimator::Integrate, moment0_out)
            .await?;
        self.collapse(cube, velocity_range, CollapseEstimator::Dispersion, rms_out)
            .await?;
        Ok(())
    }

    /// Resample the cube's velocity axis to a 1 km/s pixel scale.
    pub async fn resample_1kms(&self, cube: &Path, output: &Path) -> Result<()> {
        let command = format!(
            "sqorst in={} axis=3 mode=pixelscale pixscale=1.0 out={} method=auto",
            cube.display(),
            output.display(),
        );
        self.toolkit.run(&command, self.timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolkit::ToolOutput;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Records every command instead of running anything.
    #[derive(Default)]
    struct RecordingToolkit {
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolkitRunner for RecordingToolkit {
        async fn run(&self, command: &str, _timeout: Duration) -> Result<ToolOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(ToolOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    fn runner() -> (Arc<RecordingToolkit>, SpectralStageRunner) {
        let toolkit = Arc::new(RecordingToolkit::default());
        let runner = SpectralStageRunner::new(toolkit.clone(), Duration::from_secs(60));
        (toolkit, runner)
    }

    #[tokio::test]
    async fn test_frame_set_then_two_collapses() {
        let (toolkit, runner) = runner();
        let cube = PathBuf::from("/data/X/cube.fits");

        runner.set_velocity_frame(&cube).await.unwrap();
        runner
            .make_maps(
                &cube,
                [220.0, 320.0],
                Path::new("/data/X/mom0.fits"),
                Path::new("/data/X/noisemap.sdf"),
            )
            .await
            .unwrap();

        let commands = toolkit.commands.lock().unwrap();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains("wcsattrib"));
        assert!(commands[0].contains("newval=vrad"));
        assert!(commands[0].contains("newval=LSRK"));
        assert!(commands[1].contains("estimator=Integ"));
        assert!(commands[1].contains("low=220 high=320"));
        assert!(commands[2].contains("estimator=Sigma"));
    }

    #[tokio::test]
    async fn test_degenerate_range_makes_no_toolkit_call() {
        let (toolkit, runner) = runner();
        let cube = PathBuf::from("cube.fits");

        for range in [[320.0, 220.0], [100.0, 100.0]] {
            let err = runner
                .make_maps(&cube, range, Path::new("mom0.fits"), Path::new("rms.sdf"))
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::DegenerateRange { .. }));
        }
        assert!(toolkit.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resample_command_shape() {
        let (toolkit, runner) = runner();
        runner
            .resample_1kms(Path::new("cube.fits"), Path::new("1kms.sdf"))
            .await
            .unwrap();

        let commands = toolkit.commands.lock().unwrap();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("sqorst in=cube.fits"));
        assert!(commands[0].contains("pixscale=1.0"));
        assert!(commands[0].contains("out=1kms.sdf"));
    }
}
