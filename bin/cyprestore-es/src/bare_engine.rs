//! Local extent I/O
//!
//! Resolves an extent to its physical unit, binds an I/O buffer and hands
//! the request to the block device. Requests that need no device access
//! (reads of never-written extents, deletes) complete inline.

use cyprestore_common::{Error, RequestType, Result};
use cyprestore_storage::{BlockDevice, ExtentLocationMgr, IoMemMgr, Request, RequestInfo};
use std::sync::Arc;
use tracing::debug;

pub struct BareEngine {
    locations: Arc<ExtentLocationMgr>,
    mem: Arc<IoMemMgr>,
    device: Arc<dyn BlockDevice>,
}

impl BareEngine {
    pub fn new(
        locations: Arc<ExtentLocationMgr>,
        mem: Arc<IoMemMgr>,
        device: Arc<dyn BlockDevice>,
    ) -> Self {
        Self {
            locations,
            mem,
            device,
        }
    }

    /// Execute a checked request; its local completion always happens
    pub fn process(&self, req: &Arc<Request>, info: &RequestInfo) {
        if let Err(e) = self.dispatch(req, info) {
            debug!(
                "{} on extent {} failed locally: {}",
                info.req_type, info.extent_id, e
            );
            req.complete_local(Err(e));
        }
    }

    /// `Ok` means completion is owned by the device or already done
    fn dispatch(&self, req: &Arc<Request>, info: &RequestInfo) -> Result<()> {
        match info.req_type {
            RequestType::Read | RequestType::Scrub => {
                match self.locations.query_location(&info.extent_id, false) {
                    Ok(loc) => {
                        let unit = self.mem.get(info.size as usize)?;
                        req.set_io(loc.offset + info.offset, unit);
                        self.device.process_request(req)
                    }
                    Err(Error::ExtentEmpty(_)) => {
                        req.set_zero_fill();
                        req.complete_local(Ok(()));
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            RequestType::Write | RequestType::Replicate => {
                let loc = self.locations.query_location(&info.extent_id, true)?;
                let mut unit = self.mem.get(info.size as usize)?;
                unit.fill_from(&info.payload)?;
                req.set_io(loc.offset + info.offset, unit);
                self.device.process_request(req)
            }
            RequestType::Delete | RequestType::ReclaimExtent => {
                match self.locations.delete_extent(&info.extent_id)? {
                    Some(loc) => debug!(
                        "Released extent {} ({} bytes at {})",
                        info.extent_id, loc.size, loc.offset
                    ),
                    None => debug!("{} of unwritten extent {}", info.req_type, info.extent_id),
                }
                req.complete_local(Ok(()));
                Ok(())
            }
            RequestType::Noop => Err(Error::invalid_argument("noop request submitted")),
        }
    }

    #[must_use]
    pub fn locations(&self) -> &Arc<ExtentLocationMgr> {
        &self.locations
    }
}
