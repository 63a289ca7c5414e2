use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::JoinHandle,
};

use crate::{
    engine::{CustomFlashOptions, CustomFlasher, FlashReport},
    error::FlashError,
    ffu::FfuImage,
    flash::FlashPart,
    progress::FlashEvent,
    transport::DeviceNotifier,
};

/// A custom flash running on its own thread.
pub struct FlashJob {
    events: mpsc::Receiver<FlashEvent>,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<Result<FlashReport, FlashError>>,
}

impl FlashJob {
    pub fn spawn<N>(
        mut flasher: CustomFlasher<N>,
        image: FfuImage,
        parts: Vec<FlashPart>,
        options: CustomFlashOptions,
    ) -> std::io::Result<Self>
    where
        N: DeviceNotifier + Send + 'static,
    {
        let (sender, events) = mpsc::channel();
        flasher.set_observer(sender);
        let cancel = flasher.cancel_flag();

        let handle = std::thread::Builder::new()
            .name("custom-flash".to_string())
            .spawn(move || flasher.flash(&image, parts, &options))?;

        Ok(Self {
            events,
            cancel,
            handle,
        })
    }

    pub fn events(&self) -> &mpsc::Receiver<FlashEvent> {
        &self.events
    }

    /// Stops the job before its next attempt. A payload transfer in progress
    /// always runs to completion.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn join(self) -> Result<FlashReport, FlashError> {
        self.handle.join().unwrap_or_else(|_| {
            Err(FlashError::AbortFlash {
                chunks_written: 0,
                reason: "flashing thread panicked".to_string(),
            })
        })
    }
}
