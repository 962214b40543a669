//! Host/device buffer synchronization.
//!
//! A [`Context`] owns an accelerator plus an arena of *mirrors*: host arrays
//! paired with a device buffer. Each mirror carries an explicit freshness
//! state so that data only crosses the host/device boundary when needed:
//!
//! | state         | host copy | device copy |
//! |---------------|-----------|-------------|
//! | `Clean`       | current   | current     |
//! | `HostDirty`   | current   | stale       |
//! | `DeviceDirty` | stale     | current     |
//!
//! Dispatches refuse to read or write a `HostDirty` mirror and mark every
//! output mirror `DeviceDirty`; host reads pull on demand, at most once per
//! device write.

use crate::accel::host::HostAccelerator;
use crate::accel::{Accelerator, DeviceArg, DeviceBufferId, KernelId, KernelOptions};
use crate::error::{ConvError, Result};
use crate::kernels::KernelSource;
use tracing::{debug, trace};

/// Index of a mirror inside a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MirrorHandle(usize);

/// Which side of a mirror holds the newest data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Both copies agree.
    Clean,
    /// The host copy was written since the last push.
    HostDirty,
    /// A kernel wrote the device copy since the last pull.
    DeviceDirty,
}

/// Running count of host/device copies issued by a [`Context`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Host to device copies.
    pub pushes: usize,
    /// Device to host copies.
    pub pulls: usize,
}

#[derive(Debug)]
struct Mirror {
    host: Vec<f32>,
    device: DeviceBufferId,
    state: Freshness,
}

/// One argument of a [`Context::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    /// 32-bit signed scalar.
    Int(i32),
    /// 32-bit float scalar.
    Float(f32),
    /// Mirror the kernel only reads.
    Input(MirrorHandle),
    /// Mirror the kernel writes; its host copy becomes stale.
    Output(MirrorHandle),
    /// Per-work-group scratch of the given element count.
    Local(usize),
}

/// An accelerator together with the mirrors bound on it.
pub struct Context {
    accel: Box<dyn Accelerator>,
    mirrors: Vec<Option<Mirror>>,
    stats: TransferStats,
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("accelerator", &self.accel.name())
            .field("live_mirrors", &self.live_mirrors())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::host()
    }
}

impl Context {
    /// Context over an arbitrary accelerator.
    #[must_use]
    pub fn new(accel: Box<dyn Accelerator>) -> Self {
        Self {
            accel,
            mirrors: Vec::new(),
            stats: TransferStats::default(),
        }
    }

    /// Context over a [`HostAccelerator`].
    #[must_use]
    pub fn host() -> Self {
        Self::new(Box::new(HostAccelerator::new()))
    }

    /// Name of the underlying accelerator.
    #[must_use]
    pub fn accelerator_name(&self) -> &str {
        self.accel.name()
    }

    /// Largest work-group size the accelerator accepts.
    #[must_use]
    pub fn max_workgroup_size(&self) -> usize {
        self.accel.max_workgroup_size()
    }

    /// Transfers issued so far.
    #[must_use]
    pub const fn stats(&self) -> TransferStats {
        self.stats
    }

    /// Zeroes the transfer counters.
    pub fn reset_stats(&mut self) {
        self.stats = TransferStats::default();
    }

    /// Number of mirrors currently bound.
    #[must_use]
    pub fn live_mirrors(&self) -> usize {
        self.mirrors.iter().filter(|m| m.is_some()).count()
    }

    fn mirror(&self, handle: MirrorHandle) -> Result<&Mirror> {
        self.mirrors
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(ConvError::UnknownMirror(handle))
    }

    fn mirror_mut(&mut self, handle: MirrorHandle) -> Result<&mut Mirror> {
        self.mirrors
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(ConvError::UnknownMirror(handle))
    }

    fn insert(&mut self, mirror: Mirror) -> MirrorHandle {
        match self.mirrors.iter().position(Option::is_none) {
            Some(i) => {
                self.mirrors[i] = Some(mirror);
                MirrorHandle(i)
            }
            None => {
                self.mirrors.push(Some(mirror));
                MirrorHandle(self.mirrors.len() - 1)
            }
        }
    }

    /// Builds a kernel on the accelerator.
    ///
    /// # Errors
    ///
    /// [`ConvError::Device`] when the build fails.
    pub fn build_kernel(&mut self, source: &KernelSource, options: &KernelOptions) -> Result<KernelId> {
        debug!(
            kernel = source.name,
            accelerator = self.accel.name(),
            %options,
            "building kernel"
        );
        Ok(self.accel.build_kernel(source, options)?)
    }

    /// Binds `data` to a new device buffer. No transfer happens yet; the
    /// mirror starts `HostDirty`.
    ///
    /// # Errors
    ///
    /// [`ConvError::Device`] when the device allocation fails.
    pub fn bind(&mut self, data: Vec<f32>) -> Result<MirrorHandle> {
        let device = self.accel.alloc(data.len())?;
        let handle = self.insert(Mirror {
            host: data,
            device,
            state: Freshness::HostDirty,
        });
        trace!(?handle, "bound mirror");
        Ok(handle)
    }

    /// Binds a zero-filled array; both copies already agree.
    ///
    /// # Errors
    ///
    /// [`ConvError::Device`] when the device allocation fails.
    pub fn bind_zeroed(&mut self, len: usize) -> Result<MirrorHandle> {
        let device = self.accel.alloc(len)?;
        let handle = self.insert(Mirror {
            host: vec![0.0; len],
            device,
            state: Freshness::Clean,
        });
        trace!(?handle, len, "bound zeroed mirror");
        Ok(handle)
    }

    /// Unconditional host to device copy.
    ///
    /// # Errors
    ///
    /// Unknown handle or a transfer fault.
    pub fn push(&mut self, handle: MirrorHandle) -> Result<()> {
        let mirror = self
            .mirrors
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(ConvError::UnknownMirror(handle))?;
        self.accel.write(mirror.device, &mirror.host)?;
        mirror.state = Freshness::Clean;
        self.stats.pushes += 1;
        Ok(())
    }

    /// Device to host copy, only when a kernel wrote the device copy since
    /// the last pull.
    ///
    /// # Errors
    ///
    /// Unknown handle or a transfer fault.
    pub fn pull(&mut self, handle: MirrorHandle) -> Result<()> {
        let mirror = self
            .mirrors
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(ConvError::UnknownMirror(handle))?;
        if mirror.state == Freshness::DeviceDirty {
            self.accel.read(mirror.device, &mut mirror.host)?;
            mirror.state = Freshness::Clean;
            self.stats.pulls += 1;
        }
        Ok(())
    }

    /// Pushes only when the host copy is newer.
    ///
    /// # Errors
    ///
    /// Unknown handle or a transfer fault.
    pub fn ensure_on_device(&mut self, handle: MirrorHandle) -> Result<()> {
        if self.mirror(handle)?.state == Freshness::HostDirty {
            self.push(handle)?;
        }
        Ok(())
    }

    /// Frees the device buffer and hands back the host array as last seen on
    /// the host (no pull).
    ///
    /// # Errors
    ///
    /// Unknown handle or a device fault while freeing.
    pub fn release(&mut self, handle: MirrorHandle) -> Result<Vec<f32>> {
        let mirror = self
            .mirrors
            .get_mut(handle.0)
            .and_then(Option::take)
            .ok_or(ConvError::UnknownMirror(handle))?;
        trace!(?handle, "released mirror");
        self.accel.free(mirror.device)?;
        Ok(mirror.host)
    }

    /// Freshness of a mirror.
    ///
    /// # Errors
    ///
    /// [`ConvError::UnknownMirror`].
    pub fn freshness(&self, handle: MirrorHandle) -> Result<Freshness> {
        Ok(self.mirror(handle)?.state)
    }

    /// Element count of a mirror.
    ///
    /// # Errors
    ///
    /// [`ConvError::UnknownMirror`].
    pub fn len(&self, handle: MirrorHandle) -> Result<usize> {
        Ok(self.mirror(handle)?.host.len())
    }

    /// Up-to-date host view, pulling first if needed.
    ///
    /// # Errors
    ///
    /// Unknown handle or a transfer fault.
    pub fn host_view(&mut self, handle: MirrorHandle) -> Result<&[f32]> {
        self.pull(handle)?;
        Ok(&self.mirror(handle)?.host)
    }

    /// Mutable host view. Pulls first, then marks the host copy newer.
    ///
    /// # Errors
    ///
    /// Unknown handle or a transfer fault.
    pub fn host_mut(&mut self, handle: MirrorHandle) -> Result<&mut [f32]> {
        self.pull(handle)?;
        let mirror = self.mirror_mut(handle)?;
        mirror.state = Freshness::HostDirty;
        Ok(&mut mirror.host)
    }

    /// Launches a kernel over mirrors and waits for it.
    ///
    /// # Errors
    ///
    /// - [`ConvError::StaleDeviceCopy`] when a mirror argument is `HostDirty`
    /// - [`ConvError::Device`] when the accelerator rejects or fails the run
    pub fn dispatch(
        &mut self,
        kernel: KernelId,
        args: &[KernelArg],
        global_size: usize,
        workgroup_size: usize,
    ) -> Result<()> {
        let mut device_args = Vec::with_capacity(args.len());
        for arg in args {
            device_args.push(match *arg {
                KernelArg::Int(v) => DeviceArg::Int(v),
                KernelArg::Float(v) => DeviceArg::Float(v),
                KernelArg::Local(len) => DeviceArg::Local(len),
                KernelArg::Input(h) | KernelArg::Output(h) => {
                    let mirror = self.mirror(h)?;
                    if mirror.state == Freshness::HostDirty {
                        return Err(ConvError::StaleDeviceCopy(h));
                    }
                    DeviceArg::Buffer(mirror.device)
                }
            });
        }

        self.accel
            .dispatch(kernel, &device_args, global_size, workgroup_size)?;
        self.accel.finish()?;

        for arg in args {
            if let KernelArg::Output(h) = *arg {
                self.mirror_mut(h)?.state = Freshness::DeviceDirty;
            }
        }
        Ok(())
    }

    /// Runs `body` with a [`TransientScope`]; every mirror bound through the
    /// scope is released when `body` returns, on success and on error.
    ///
    /// # Errors
    ///
    /// The first error of `body`, otherwise the first release error.
    pub fn with_scope<R>(
        &mut self,
        body: impl FnOnce(&mut Self, &mut TransientScope) -> Result<R>,
    ) -> Result<R> {
        let mut scope = TransientScope::default();
        let result = body(self, &mut scope);
        let mut released = Ok(());
        for handle in scope.handles.drain(..).rev() {
            if let Err(e) = self.release(handle) {
                if released.is_ok() {
                    released = Err(e);
                }
            }
        }
        let value = result?;
        released.map(|()| value)
    }
}

/// Mirrors that live for a single call. See [`Context::with_scope`].
#[derive(Debug, Default)]
pub struct TransientScope {
    handles: Vec<MirrorHandle>,
}

impl TransientScope {
    /// Binds `data` for the duration of the scope and pushes it.
    ///
    /// # Errors
    ///
    /// Allocation or transfer faults.
    pub fn upload(&mut self, ctx: &mut Context, data: &[f32]) -> Result<MirrorHandle> {
        let handle = ctx.bind(data.to_vec())?;
        self.handles.push(handle);
        ctx.push(handle)?;
        Ok(handle)
    }

    /// Binds a zeroed array for the duration of the scope.
    ///
    /// # Errors
    ///
    /// Allocation faults.
    pub fn zeroed(&mut self, ctx: &mut Context, len: usize) -> Result<MirrorHandle> {
        let handle = ctx.bind_zeroed(len)?;
        self.handles.push(handle);
        Ok(handle)
    }

    /// Number of mirrors the scope will release.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the scope holds no mirrors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels;

    #[test]
    fn bound_data_is_host_dirty_until_pushed() {
        let mut ctx = Context::host();
        let h = ctx.bind(vec![1.0, 2.0]).unwrap();
        assert_eq!(ctx.freshness(h).unwrap(), Freshness::HostDirty);
        ctx.ensure_on_device(h).unwrap();
        assert_eq!(ctx.freshness(h).unwrap(), Freshness::Clean);
        ctx.ensure_on_device(h).unwrap();
        assert_eq!(ctx.stats().pushes, 1);
    }

    #[test]
    fn pull_is_a_no_op_unless_device_dirty() {
        let mut ctx = Context::host();
        let h = ctx.bind_zeroed(3).unwrap();
        ctx.pull(h).unwrap();
        assert_eq!(ctx.host_view(h).unwrap(), &[0.0; 3]);
        assert_eq!(ctx.stats().pulls, 0);
    }

    #[test]
    fn dispatch_marks_outputs_device_dirty_and_host_view_pulls_once() {
        let mut ctx = Context::host();
        let kernel = ctx
            .build_kernel(&kernels::ADD_IN_PLACE, &KernelOptions::new())
            .unwrap();
        let deltas = ctx.bind(vec![1.0, 2.0]).unwrap();
        let values = ctx.bind(vec![10.0, 20.0]).unwrap();
        ctx.push(deltas).unwrap();
        ctx.push(values).unwrap();
        ctx.dispatch(
            kernel,
            &[KernelArg::Int(2), KernelArg::Input(deltas), KernelArg::Output(values)],
            2,
            2,
        )
        .unwrap();
        assert_eq!(ctx.freshness(values).unwrap(), Freshness::DeviceDirty);
        assert_eq!(ctx.freshness(deltas).unwrap(), Freshness::Clean);

        assert_eq!(ctx.host_view(values).unwrap(), &[11.0, 22.0]);
        assert_eq!(ctx.host_view(values).unwrap(), &[11.0, 22.0]);
        assert_eq!(ctx.stats().pulls, 1);
    }

    #[test]
    fn dispatch_refuses_host_dirty_inputs() {
        let mut ctx = Context::host();
        let kernel = ctx
            .build_kernel(&kernels::ADD_IN_PLACE, &KernelOptions::new())
            .unwrap();
        let deltas = ctx.bind(vec![1.0]).unwrap();
        let values = ctx.bind_zeroed(1).unwrap();
        let err = ctx
            .dispatch(
                kernel,
                &[KernelArg::Int(1), KernelArg::Input(deltas), KernelArg::Output(values)],
                1,
                1,
            )
            .unwrap_err();
        assert_eq!(err, ConvError::StaleDeviceCopy(deltas));
    }

    #[test]
    fn host_mut_marks_host_dirty() {
        let mut ctx = Context::host();
        let h = ctx.bind_zeroed(2).unwrap();
        ctx.host_mut(h).unwrap()[1] = 5.0;
        assert_eq!(ctx.freshness(h).unwrap(), Freshness::HostDirty);
        assert_eq!(ctx.release(h).unwrap(), vec![0.0, 5.0]);
        assert_eq!(ctx.freshness(h), Err(ConvError::UnknownMirror(h)));
    }

    #[test]
    fn scope_releases_on_success_and_on_error() {
        let mut ctx = Context::host();
        let kept = ctx.bind_zeroed(1).unwrap();

        let sum = ctx
            .with_scope(|ctx, scope| {
                let a = scope.upload(ctx, &[1.0, 2.0])?;
                scope.zeroed(ctx, 4)?;
                Ok(ctx.host_view(a)?.iter().sum::<f32>())
            })
            .unwrap();
        assert_eq!(sum, 3.0);
        assert_eq!(ctx.live_mirrors(), 1);

        let err = ctx
            .with_scope(|ctx, scope| -> Result<()> {
                scope.zeroed(ctx, 4)?;
                Err(ConvError::InvalidConfig("early exit".into()))
            })
            .unwrap_err();
        assert_eq!(err, ConvError::InvalidConfig("early exit".into()));
        assert_eq!(ctx.live_mirrors(), 1);
        assert!(ctx.len(kept).is_ok());
    }
}
