use std::sync::Mutex;

use obs_monitor::error::SampleError;
use obs_monitor::system_stats::SystemStats;

/// Host stats reader returning fixed values
pub struct MockSystemStats {
    values: Mutex<(f64, f64)>,
    failure: Mutex<Option<String>>,
}

impl MockSystemStats {
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            values: Mutex::new((cpu_percent, memory_percent)),
            failure: Mutex::new(None),
        }
    }

    pub fn set(&self, cpu_percent: f64, memory_percent: f64) {
        *self.values.lock().unwrap() = (cpu_percent, memory_percent);
    }

    pub fn fail_with(&self, reason: Option<&str>) {
        *self.failure.lock().unwrap() = reason.map(str::to_string);
    }

    fn check(&self) -> Result<(), SampleError> {
        match self.failure.lock().unwrap().as_ref() {
            Some(reason) => Err(SampleError::SystemStats {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl SystemStats for MockSystemStats {
    fn cpu_percent(&self) -> Result<f64, SampleError> {
        self.check()?;
        Ok(self.values.lock().unwrap().0)
    }

    fn memory_percent(&self) -> Result<f64, SampleError> {
        self.check()?;
        Ok(self.values.lock().unwrap().1)
    }
}
