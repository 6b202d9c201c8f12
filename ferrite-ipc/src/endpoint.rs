//! IPC endpoints: the rendezvous objects `ipc_send`/`ipc_recv` block on.
//!
//! Every blocked sender or receiver parks a [`WaitRecord`] on its own kernel
//! stack and links it into the endpoint's send or receive queue by raw
//! pointer. The record's own stack address doubles as the
//! [`Scheduler::thread_sleep`]/`thread_wakeup` channel: since that address
//! is unique to this specific blocked call, `thread_wakeup` waking "every
//! thread blocked on this channel" always resolves to exactly one thread,
//! without needing a wake-a-specific-thread primitive. The record stays
//! valid for as long as the call is blocked because a sleeping thread's
//! kernel stack is simply left alone until the scheduler runs it again.

use ferrite_core::id::{EndpointId, Pid, Tid};
use ferrite_core::sync::SpinLock;
use ferrite_sched::sched::Scheduler;
use planck_noalloc::vec::ArrayVec;

use crate::error::IpcError;
use crate::message::Message;

/// Upper bound on threads simultaneously blocked on one side of a single
/// endpoint. Generous for a microkernel core whose IPC fan-in is expected
/// to be a handful of client threads per server endpoint.
pub const MAX_WAITERS: usize = 32;

/// Upper bound on waiters woken in one [`Endpoint::destroy`] call (both
/// queues combined).
const MAX_DESTROY_WAKEUPS: usize = MAX_WAITERS * 2;

bitflags::bitflags! {
    /// Endpoint state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EndpointFlags: u8 {
        /// The endpoint has a process bound to it (as opposed to a
        /// transient reply endpoint).
        const BOUND        = 1 << 0;
        /// This is a one-shot reply endpoint created for a single `Call`.
        const REPLY        = 1 << 1;
        /// This endpoint is a notification object, not a message endpoint.
        /// (Notification objects are otherwise represented by
        /// [`crate::notification::Notification`]; the flag exists so a
        /// capability's endpoint reference can distinguish the two kinds
        /// without a second capability kind enum variant per call site.)
        const NOTIFICATION = 1 << 2;
        /// The endpoint has been destroyed; every queued waiter has been
        /// (or is being) woken with [`IpcError::EndpointDead`].
        const DEAD         = 1 << 3;
    }
}

/// A blocked sender's or receiver's parked call state.
///
/// Built as a local variable on the blocked thread's own stack; never
/// heap-allocated.
struct WaitRecord {
    /// The thread this record belongs to. Unused by the rendezvous logic
    /// itself but useful for debugging/queue dumps.
    #[allow(dead_code)]
    tid: Tid,
    /// For a blocked sender: the message being sent (read by the receiver
    /// that completes the rendezvous). For a blocked receiver: the buffer
    /// the completing sender writes the delivered message into.
    message: Message,
    /// Set by whichever side completes the rendezvous (or by endpoint
    /// destruction) before the waiter is woken.
    result: IpcError,
}

/// A `*mut WaitRecord`, wrapped so it can live in a [`SpinLock`]'d
/// [`ArrayVec`] (raw pointers aren't `Send` by default).
///
/// # Safety
/// The pointee outlives the pointer's residency in a queue: it is only
/// ever removed from the queue by the thread that owns it (on the way out
/// of `send`/`recv`) or by the thread completing the rendezvous, both of
/// which happen before that local variable goes out of scope.
struct WaiterPtr(*mut WaitRecord);

// SAFETY: see `WaiterPtr`'s doc comment; the pointer is never dereferenced
// concurrently from two threads (the endpoint lock serializes all queue
// manipulation, and after dequeue only one side touches the record before
// waking the other).
unsafe impl Send for WaiterPtr {}

type WaiterQueue = ArrayVec<WaiterPtr, MAX_WAITERS>;

struct EndpointInner {
    flags: EndpointFlags,
    send_queue: WaiterQueue,
    recv_queue: WaiterQueue,
    owner: Pid,
    bound_thread: Option<Tid>,
    messages_sent: u64,
    messages_received: u64,
}

/// An IPC rendezvous endpoint.
///
/// Invariant: every thread whose state is "blocked on IPC" appears on
/// exactly one endpoint's send or receive queue, never both and never more
/// than once.
pub struct Endpoint {
    id: EndpointId,
    inner: SpinLock<EndpointInner>,
}

impl Endpoint {
    /// Creates a new, live endpoint owned by `owner`.
    pub fn new(id: EndpointId, owner: Pid, flags: EndpointFlags) -> Self {
        Self {
            id,
            inner: SpinLock::new(EndpointInner {
                flags,
                send_queue: ArrayVec::new(),
                recv_queue: ArrayVec::new(),
                owner,
                bound_thread: None,
                messages_sent: 0,
                messages_received: 0,
            }),
        }
    }

    /// This endpoint's identifier.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// The process that owns this endpoint.
    pub fn owner(&self) -> Pid {
        self.inner.lock().owner
    }

    /// Binds a specific thread to this endpoint (used for reply endpoints,
    /// whose sole legitimate receiver is the calling thread).
    pub fn bind_thread(&self, tid: Tid) {
        let mut inner = self.inner.lock();
        inner.bound_thread = Some(tid);
        inner.flags.insert(EndpointFlags::BOUND);
    }

    /// Total messages successfully delivered through this endpoint as a
    /// sender, and as a receiver.
    pub fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.messages_sent, inner.messages_received)
    }

    /// Whether the endpoint has been destroyed.
    pub fn is_dead(&self) -> bool {
        self.inner.lock().flags.contains(EndpointFlags::DEAD)
    }

    /// Sends `msg` through this endpoint.
    ///
    /// If a receiver is already queued, the rendezvous completes
    /// immediately and the receiver is woken. Otherwise, unless the
    /// message carries [`crate::message::MessageFlags::NON_BLOCKING`], the
    /// caller blocks until a receiver arrives or the endpoint is
    /// destroyed.
    pub fn send(&self, scheduler: &Scheduler, msg: &Message) -> Result<(), IpcError> {
        let mut inner = self.inner.lock();
        if inner.flags.contains(EndpointFlags::DEAD) {
            return Err(IpcError::EndpointDead);
        }

        if inner.recv_queue.len() != 0 {
            let receiver = inner.recv_queue.remove(0);
            // SAFETY: the receiver's stack frame is still live; it is
            // parked in `Scheduler::thread_sleep` waiting on this exact
            // pointer as its wake channel.
            let record = unsafe { &mut *receiver.0 };
            record.message = *msg;
            record.result = IpcError::Ok;
            inner.messages_sent += 1;
            let channel = receiver.0 as u64;
            drop(inner);
            scheduler.thread_wakeup(channel);
            return Ok(());
        }

        if msg.tag.flags().contains(crate::message::MessageFlags::NON_BLOCKING) {
            return Err(IpcError::NoPartner);
        }
        if inner.send_queue.is_full() {
            return Err(IpcError::Overflow);
        }

        let tid = scheduler.current().ok_or(IpcError::Invalid)?;
        let mut record = WaitRecord {
            tid,
            message: *msg,
            result: IpcError::Canceled,
        };
        let record_ptr: *mut WaitRecord = &mut record;
        inner.send_queue.insert(inner.send_queue.len(), WaiterPtr(record_ptr));
        drop(inner);

        scheduler.thread_sleep(record_ptr as u64);

        if record.result == IpcError::Ok {
            Ok(())
        } else {
            Err(record.result)
        }
    }

    /// Receives a message through this endpoint.
    ///
    /// If a sender is already queued, the rendezvous completes
    /// immediately. Otherwise, unless `non_blocking` is set, the caller
    /// blocks until a sender arrives or the endpoint is destroyed.
    pub fn recv(&self, scheduler: &Scheduler, non_blocking: bool) -> Result<Message, IpcError> {
        let mut inner = self.inner.lock();
        if inner.flags.contains(EndpointFlags::DEAD) {
            return Err(IpcError::EndpointDead);
        }

        if inner.send_queue.len() != 0 {
            let sender = inner.send_queue.remove(0);
            // SAFETY: see `send`'s matching comment.
            let record = unsafe { &mut *sender.0 };
            let delivered = record.message;
            record.result = IpcError::Ok;
            inner.messages_received += 1;
            let channel = sender.0 as u64;
            drop(inner);
            scheduler.thread_wakeup(channel);
            return Ok(delivered);
        }

        if non_blocking {
            return Err(IpcError::NoPartner);
        }
        if inner.recv_queue.is_full() {
            return Err(IpcError::Overflow);
        }

        let tid = scheduler.current().ok_or(IpcError::Invalid)?;
        let mut record = WaitRecord {
            tid,
            message: Message::empty(),
            result: IpcError::Canceled,
        };
        let record_ptr: *mut WaitRecord = &mut record;
        inner.recv_queue.insert(inner.recv_queue.len(), WaiterPtr(record_ptr));
        drop(inner);

        scheduler.thread_sleep(record_ptr as u64);

        if record.result == IpcError::Ok {
            Ok(record.message)
        } else {
            Err(record.result)
        }
    }

    /// `Call`: send `msg` on this endpoint, then block for the reply on
    /// `reply_ep`. `reply_ep` should be a fresh per-call reply endpoint
    /// bound to the calling thread (see §4.7's open question on reply
    /// endpoints; this crate resolves it by making the reply endpoint an
    /// explicit parameter rather than an implicit per-thread slot).
    pub fn call(&self, scheduler: &Scheduler, msg: &Message, reply_ep: &Endpoint) -> Result<Message, IpcError> {
        self.send(scheduler, msg)?;
        reply_ep.recv(scheduler, false)
    }

    /// `Reply`: sends `msg` to the single thread blocked on this (reply)
    /// endpoint, waking it specifically. Implemented as an ordinary
    /// non-blocking-capable send: a reply endpoint has at most one
    /// receiver queued (the caller blocked in [`Endpoint::call`]), so
    /// dequeuing the head of the receive queue always reaches that exact
    /// thread.
    pub fn reply(&self, scheduler: &Scheduler, msg: &Message) -> Result<(), IpcError> {
        self.send(scheduler, msg)
    }

    /// `ReplyReceive`: replies to the previous caller on `reply_ep`, then
    /// blocks on this endpoint for the next request — the canonical
    /// server loop. Not truly atomic (the reply completes before the
    /// receive begins), matching this endpoint design's resolution of the
    /// open reply-endpoint question.
    pub fn reply_recv(&self, scheduler: &Scheduler, reply_ep: &Endpoint, reply_msg: &Message) -> Result<Message, IpcError> {
        reply_ep.reply(scheduler, reply_msg)?;
        self.recv(scheduler, false)
    }

    /// Destroys the endpoint: marks it dead and wakes every currently
    /// queued sender and receiver with [`IpcError::EndpointDead`]. Safe to
    /// call even if threads are queued; none of them remains blocked
    /// forever.
    pub fn destroy(&self, scheduler: &Scheduler) {
        let mut inner = self.inner.lock();
        inner.flags.insert(EndpointFlags::DEAD);
        let mut channels: ArrayVec<u64, MAX_DESTROY_WAKEUPS> = ArrayVec::new();

        while inner.send_queue.len() != 0 {
            let waiter = inner.send_queue.remove(0);
            // SAFETY: see `send`'s matching comment.
            let record = unsafe { &mut *waiter.0 };
            record.result = IpcError::EndpointDead;
            let _ = channels.insert(channels.len(), waiter.0 as u64);
        }
        while inner.recv_queue.len() != 0 {
            let waiter = inner.recv_queue.remove(0);
            // SAFETY: see `send`'s matching comment.
            let record = unsafe { &mut *waiter.0 };
            record.result = IpcError::EndpointDead;
            let _ = channels.insert(channels.len(), waiter.0 as u64);
        }
        drop(inner);

        for channel in channels.as_slice() {
            scheduler.thread_wakeup(*channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use ferrite_core::arch::x86_64::CpuContext;
    use ferrite_core::id::Pid;
    use ferrite_sched::thread::Thread;

    use super::*;
    use crate::message::{MessageFlags, MessageTag};

    unsafe fn fake_switch(prev: *mut CpuContext, next: *const CpuContext) {
        unsafe {
            if !prev.is_null() {
                let _ = (*prev).rip;
            }
            let _ = (*next).rip;
        }
    }

    fn thread(tid: u32, priority: u8) -> Thread {
        Thread::new(Tid::new(tid), Pid::new(tid), priority, 0x4000, 8192)
    }

    // These tests exercise the rendezvous logic by placing a `WaitRecord`
    // directly on the endpoint's queue via the endpoint's own lock, rather
    // than by actually blocking a thread through `Scheduler::thread_sleep`.
    // `fake_switch` never really swaps stacks, so a genuinely blocked call
    // in this host test harness "returns" the moment it sleeps rather than
    // when it is later woken — exactly the scheduler test suite's own
    // convention (see `ferrite-sched`'s `waitqueue` tests, which only ever
    // assert on `current()` afterward, never on a blocked call's return
    // value). Driving the queue directly instead keeps these tests honest
    // about what they verify: the rendezvous data transfer and wakeup call,
    // not the full cross-thread suspend/resume (which needs real hardware
    // or a real context switch to observe).

    #[test]
    fn send_completes_immediately_against_queued_receiver() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.schedule();

        let ep = Endpoint::new(EndpointId::new(1), Pid::new(1), EndpointFlags::empty());
        let mut waiting = WaitRecord {
            tid: Tid::new(1),
            message: Message::empty(),
            result: IpcError::Canceled,
        };
        let waiting_ptr: *mut WaitRecord = &mut waiting;
        {
            let mut inner = ep.inner.lock();
            inner.recv_queue.insert(0, WaiterPtr(waiting_ptr));
        }

        let tag = MessageTag::new(100, 2, 0, MessageFlags::empty());
        let msg = Message::fast(tag, [0xCAFE0000, 0xDEAD0000, 0, 0, 0, 0, 0, 0]);
        ep.send(&sched, &msg).unwrap();

        assert_eq!(waiting.result, IpcError::Ok);
        assert_eq!(waiting.message.tag.label(), 100);
        assert_eq!(waiting.message.regs[0], 0xCAFE0000);
        assert_eq!(waiting.message.regs[1], 0xDEAD0000);
        assert_eq!(ep.counters(), (1, 0));
    }

    #[test]
    fn recv_completes_immediately_against_queued_sender() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.schedule();

        let ep = Endpoint::new(EndpointId::new(2), Pid::new(1), EndpointFlags::empty());
        let tag = MessageTag::new(100, 2, 0, MessageFlags::empty());
        let mut waiting = WaitRecord {
            tid: Tid::new(1),
            message: Message::fast(tag, [0xCAFE0000, 0xDEAD0000, 0, 0, 0, 0, 0, 0]),
            result: IpcError::Canceled,
        };
        let waiting_ptr: *mut WaitRecord = &mut waiting;
        {
            let mut inner = ep.inner.lock();
            inner.send_queue.insert(0, WaiterPtr(waiting_ptr));
        }

        let delivered = ep.recv(&sched, false).unwrap();

        assert_eq!(waiting.result, IpcError::Ok);
        assert_eq!(delivered.tag.label(), 100);
        assert_eq!(delivered.regs[0], 0xCAFE0000);
        assert_eq!(delivered.regs[1], 0xDEAD0000);
        assert_eq!(ep.counters(), (0, 1));
    }

    #[test]
    fn non_blocking_send_with_no_receiver_fails_fast() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.schedule();

        let ep = Endpoint::new(EndpointId::new(2), Pid::new(1), EndpointFlags::empty());
        let tag = MessageTag::new(1, 0, 0, MessageFlags::NON_BLOCKING);
        let msg = Message::fast(tag, [0; 8]);
        assert_eq!(ep.send(&sched, &msg), Err(IpcError::NoPartner));
    }

    #[test]
    fn non_blocking_recv_with_no_sender_fails_fast() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.schedule();

        let ep = Endpoint::new(EndpointId::new(3), Pid::new(1), EndpointFlags::empty());
        assert_eq!(ep.recv(&sched, true), Err(IpcError::NoPartner));
    }

    #[test]
    fn destroy_wakes_every_queued_waiter_with_dead_error() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();

        let ep = Endpoint::new(EndpointId::new(4), Pid::new(1), EndpointFlags::empty());
        let mut receiver = WaitRecord {
            tid: Tid::new(1),
            message: Message::empty(),
            result: IpcError::Canceled,
        };
        let mut sender = WaitRecord {
            tid: Tid::new(1),
            message: Message::empty(),
            result: IpcError::Canceled,
        };
        {
            let mut inner = ep.inner.lock();
            inner.recv_queue.insert(0, WaiterPtr(&mut receiver));
            inner.send_queue.insert(0, WaiterPtr(&mut sender));
        }

        ep.destroy(&sched);

        assert_eq!(receiver.result, IpcError::EndpointDead);
        assert_eq!(sender.result, IpcError::EndpointDead);
        assert!(ep.is_dead());
    }

    #[test]
    fn reply_wakes_the_queued_caller() {
        let sched = Scheduler::new(fake_switch);
        sched.set_idle(thread(0, 139)).unwrap();
        sched.spawn(thread(1, 100)).unwrap();
        sched.schedule();

        let reply_ep = Endpoint::new(EndpointId::new(5), Pid::new(2), EndpointFlags::REPLY);
        let mut waiting = WaitRecord {
            tid: Tid::new(1),
            message: Message::empty(),
            result: IpcError::Canceled,
        };
        let waiting_ptr: *mut WaitRecord = &mut waiting;
        {
            let mut inner = reply_ep.inner.lock();
            inner.recv_queue.insert(0, WaiterPtr(waiting_ptr));
        }

        let reply_tag = MessageTag::new(11, 1, 0, MessageFlags::empty());
        let reply = Message::fast(reply_tag, [43, 0, 0, 0, 0, 0, 0, 0]);
        reply_ep.reply(&sched, &reply).unwrap();

        assert_eq!(waiting.result, IpcError::Ok);
        assert_eq!(waiting.message.regs[0], 43);
    }
}
