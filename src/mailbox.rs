// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-message mailboxes and the wait queues used to learn when a busy
//! mailbox becomes writable again.
//!
//! A mailbox cycles `Empty -> Received -> Read -> Empty`. A sender that finds
//! the destination busy never waits for it: it gets [`AxError::WouldBlock`]
//! and, if it asked to be notified, its wait entry for the destination is
//! queued on the destination's waiter list. Once the destination clears its
//! mailbox, each waiter entry is moved onto the ready list of the VM that owns
//! it, which that VM drains with [`VmRegistry::mailbox_writable_get`].
//!
//! A wait entry is linked into two lists owned by two different VMs. Its
//! `wait_links` are protected by the lock of the VM waited on, its
//! `ready_links` by the lock of the waiting VM, so moving an entry from one
//! list to the other takes the two locks one after the other, never together.

use core::cell::UnsafeCell;

use axerrno::{ax_err, AxError, AxResult};

use crate::config::{VCpuIndex, VmId, MAILBOX_SIZE};
use crate::mm::HostVirtAddr;
use crate::vm::{TwoVmLocked, VmLocked};
use crate::{PartitionHal, VCpu, VCpuState, Vm, VmRegistry};

/// The state of a mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxState {
    /// There is no message in the mailbox.
    Empty,
    /// There is a message in the mailbox that is waiting for a reader.
    Received,
    /// There is a message in the mailbox that has been read.
    Read,
}

/// Description of the message held in a mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    /// VM that sent the message.
    pub sender: VmId,
    /// Size of the payload at the start of the receive page.
    pub size: usize,
}

/// Link of a wait entry in one list.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ListLink {
    next: Option<usize>,
    linked: bool,
}

/// FIFO of wait entries, threaded through their links by VM slot index.
#[derive(Clone, Copy, Debug, Default)]
struct WaitList {
    head: Option<usize>,
    tail: Option<usize>,
}

#[derive(Clone, Copy)]
enum ListKind {
    /// A mailbox's `waiter_list`: VMs waiting for it to become writable.
    Waiter,
    /// A VM's `ready_list`: mailboxes that became writable for it.
    Ready,
}

/// Entry used by one VM to wait on the mailbox of another.
pub struct WaitEntry {
    /// The VM that is waiting for a mailbox to become writable.
    waiting_vm: VmId,
    /// Slot of the VM whose mailbox is waited on.
    target_index: usize,
    /// Links in the target's `waiter_list`. Protected by the target's lock.
    wait_links: UnsafeCell<ListLink>,
    /// Links in the waiting VM's `ready_list`. Protected by the waiting VM's lock.
    ready_links: UnsafeCell<ListLink>,
}

// SAFETY: the two link cells are only reached through `VmLocked::link`, which
// requires holding the lock that protects the cell in question.
unsafe impl Sync for WaitEntry {}

impl WaitEntry {
    pub(crate) fn new(waiting_vm: VmId, target_index: usize) -> Self {
        Self {
            waiting_vm,
            target_index,
            wait_links: UnsafeCell::new(ListLink::default()),
            ready_links: UnsafeCell::new(ListLink::default()),
        }
    }

    /// The VM that owns this entry.
    pub fn waiting_vm(&self) -> VmId {
        self.waiting_vm
    }
}

/// A VM's mailbox.
#[derive(Debug)]
pub struct Mailbox {
    state: MailboxState,
    /// Hypervisor mapping of the VM's receive page.
    recv: Option<HostVirtAddr>,
    /// Hypervisor mapping of the VM's send page.
    send: Option<HostVirtAddr>,
    recv_message: Option<Message>,
    waiter_list: WaitList,
    ready_list: WaitList,
}

impl Mailbox {
    pub(crate) const fn new() -> Self {
        Self {
            state: MailboxState::Empty,
            recv: None,
            send: None,
            recv_message: None,
            waiter_list: WaitList {
                head: None,
                tail: None,
            },
            ready_list: WaitList {
                head: None,
                tail: None,
            },
        }
    }

    /// Current state.
    pub fn state(&self) -> MailboxState {
        self.state
    }

    /// The message held by the mailbox, unless it is empty.
    pub fn message(&self) -> Option<Message> {
        self.recv_message
    }

    /// Whether the send and receive pages have been set up.
    pub fn is_configured(&self) -> bool {
        self.send.is_some() && self.recv.is_some()
    }

    /// Whether some VM waits for this mailbox to become writable.
    pub fn has_waiters(&self) -> bool {
        self.waiter_list.head.is_some()
    }

    /// Whether notifications are pending for the owner of this mailbox.
    pub fn has_ready(&self) -> bool {
        self.ready_list.head.is_some()
    }
}

impl<'a, H: PartitionHal> VmLocked<'a, H> {
    fn list(&mut self, kind: ListKind) -> &mut WaitList {
        let mailbox = &mut self.inner.mailbox;
        match kind {
            ListKind::Waiter => &mut mailbox.waiter_list,
            ListKind::Ready => &mut mailbox.ready_list,
        }
    }

    /// Returns the link of list `kind` of this VM for the entry identified by
    /// `index`: the waiting VM's slot for the waiter list, the slot of the VM
    /// waited on for the ready list.
    fn link<'s>(
        &'s mut self,
        registry: &'s VmRegistry<H>,
        kind: ListKind,
        index: usize,
    ) -> &'s mut ListLink {
        let vm = self.vm();
        debug_assert!(core::ptr::eq(registry.vm_at(vm.index()), vm));
        let cell = match kind {
            ListKind::Waiter => {
                let entry = registry.vm_at(index).wait_entry(vm.index());
                debug_assert_eq!(entry.target_index, vm.index());
                &entry.wait_links
            }
            ListKind::Ready => {
                let entry = vm.wait_entry(index);
                debug_assert_eq!(entry.waiting_vm, vm.id());
                &entry.ready_links
            }
        };
        // SAFETY: the `wait_links` of entries targeting this VM and the
        // `ready_links` of this VM's own entries are protected by this VM's
        // lock, which we hold. The link borrows `self` mutably, so no other
        // reference to it can be made through this guard meanwhile.
        unsafe { &mut *cell.get() }
    }

    /// Appends entry `index` to list `kind`. Returns `false` if it was
    /// already linked.
    fn list_push(&mut self, registry: &VmRegistry<H>, kind: ListKind, index: usize) -> bool {
        if self.link(registry, kind, index).linked {
            return false;
        }
        *self.link(registry, kind, index) = ListLink {
            next: None,
            linked: true,
        };
        let tail = self.list(kind).tail;
        match tail {
            Some(tail) => self.link(registry, kind, tail).next = Some(index),
            None => self.list(kind).head = Some(index),
        }
        self.list(kind).tail = Some(index);
        true
    }

    /// Unlinks and returns the first entry of list `kind`.
    fn list_pop(&mut self, registry: &VmRegistry<H>, kind: ListKind) -> Option<usize> {
        let head = self.list(kind).head?;
        let link = core::mem::take(self.link(registry, kind, head));
        let list = self.list(kind);
        list.head = link.next;
        if list.head.is_none() {
            list.tail = None;
        }
        Some(head)
    }
}

impl<H: PartitionHal> Vm<H> {
    /// Installs the hypervisor mappings of the VM's send and receive pages.
    ///
    /// # Safety
    ///
    /// `send` and `recv` must map two distinct [`MAILBOX_SIZE`]-byte pages of
    /// this VM that stay mapped for as long as the VM exists.
    pub unsafe fn configure_mailbox(&self, send: HostVirtAddr, recv: HostVirtAddr) -> AxResult {
        if send.as_usize() == 0 || recv.as_usize() == 0 || send == recv {
            return ax_err!(InvalidInput, "invalid mailbox pages");
        }
        let mut locked = self.lock();
        let mailbox = &mut locked.inner.mailbox;
        if mailbox.send.is_some() || mailbox.recv.is_some() {
            return ax_err!(AlreadyExists, "mailbox already configured");
        }
        mailbox.send = Some(send);
        mailbox.recv = Some(recv);
        Ok(())
    }
}

impl<H: PartitionHal> VmRegistry<H> {
    /// Copies `size` bytes from the send page of `from` into the mailbox of
    /// VM `to_id`.
    ///
    /// If the destination cannot take the message right now, nothing changes
    /// and [`AxError::WouldBlock`] is returned; with `notify` set, `from` is
    /// also queued to learn when the mailbox becomes writable.
    ///
    /// On delivery, one vcpu of the destination blocked on its mailbox is made
    /// ready, and its index is returned for the scheduler to act on.
    pub fn mailbox_send(
        &self,
        from: &Vm<H>,
        to_id: VmId,
        size: usize,
        notify: bool,
    ) -> AxResult<Option<VCpuIndex>> {
        let Some(to) = self.find(to_id) else {
            debug!("VM {} sends to unknown VM {}", from.id(), to_id);
            return ax_err!(NotFound, "no such VM");
        };
        if to.id() == from.id() {
            return ax_err!(InvalidInput, "a VM cannot send to itself");
        }
        if size > MAILBOX_SIZE {
            return ax_err!(InvalidInput, "message larger than a mailbox page");
        }

        let TwoVmLocked {
            vm1: mut to_locked,
            vm2: from_locked,
        } = Vm::lock_both(to, from);

        let Some(send) = from_locked.mailbox().send else {
            return ax_err!(BadState, "sender mailbox is not configured");
        };
        let writable = match to_locked.mailbox() {
            Mailbox {
                state: MailboxState::Empty,
                recv: Some(recv),
                ..
            } => Some(*recv),
            _ => None,
        };
        let Some(recv) = writable else {
            if notify && to_locked.list_push(self, ListKind::Waiter, from.index()) {
                debug!("VM {} waits for the mailbox of VM {}", from.id(), to.id());
            }
            return Err(AxError::WouldBlock);
        };

        // SAFETY: both pages were installed by `configure_mailbox`, are distinct
        // and hold at least `MAILBOX_SIZE` bytes; the two VM locks keep anyone
        // else from touching them.
        unsafe { core::ptr::copy_nonoverlapping(send.as_ptr(), recv.as_mut_ptr(), size) };
        drop(from_locked);

        let mailbox = &mut to_locked.inner.mailbox;
        mailbox.recv_message = Some(Message {
            sender: from.id(),
            size,
        });
        mailbox.state = MailboxState::Received;

        // Receivers block with the VM lock held, so waking them under it cannot
        // miss one.
        let woken = to.vcpus().find_map(|vcpu| {
            let mut locked = vcpu.lock();
            if locked.state() != VCpuState::BlockedMailbox {
                return None;
            }
            locked
                .transition_state(VCpuState::BlockedMailbox, VCpuState::Ready)
                .ok()
                .map(|_| vcpu.index())
        });
        Ok(woken)
    }

    /// Takes the message out of the mailbox of `vm` on behalf of its running
    /// vcpu `current`, moving the mailbox to [`MailboxState::Read`].
    ///
    /// If there is no unread message, returns [`AxError::WouldBlock`]; with
    /// `block` set, `current` is first moved to
    /// [`VCpuState::BlockedMailbox`] and will be made ready by the next
    /// delivery.
    pub fn mailbox_receive(&self, vm: &Vm<H>, current: &VCpu<H>, block: bool) -> AxResult<Message> {
        assert_eq!(current.vm_id(), vm.id(), "vcpu does not belong to VM");

        let mut locked = vm.lock();
        let mailbox = &mut locked.inner.mailbox;
        if let (MailboxState::Received, Some(message)) = (mailbox.state, mailbox.recv_message) {
            mailbox.state = MailboxState::Read;
            return Ok(message);
        }
        if block {
            current
                .lock()
                .transition_state(VCpuState::Running, VCpuState::BlockedMailbox)?;
        }
        Err(AxError::WouldBlock)
    }

    /// Releases a read message, making the mailbox of `vm` writable again.
    ///
    /// Returns whether other VMs are waiting to be told about it, in which
    /// case [`VmRegistry::notify_waiters`] should follow. Clearing a message
    /// that has not been read is refused.
    pub fn mailbox_clear(&self, vm: &Vm<H>) -> AxResult<bool> {
        let mut locked = vm.lock();
        let mailbox = &mut locked.inner.mailbox;
        match mailbox.state {
            MailboxState::Empty => Ok(false),
            MailboxState::Received => ax_err!(BadState, "cannot clear an unread message"),
            MailboxState::Read => {
                mailbox.state = MailboxState::Empty;
                mailbox.recv_message = None;
                Ok(mailbox.has_waiters())
            }
        }
    }

    /// Moves the first VM waiting on the mailbox of `vm` onto that VM's ready
    /// list, and returns its id.
    pub fn mailbox_waiter_get(&self, vm: &Vm<H>) -> Option<VmId> {
        let waiting_index = {
            let mut locked = vm.lock();
            locked.list_pop(self, ListKind::Waiter)?
        };

        let waiting = self.vm_at(waiting_index);
        let mut locked = waiting.lock();
        locked.list_push(self, ListKind::Ready, vm.index());
        debug!("VM {}: mailbox of VM {} is writable", waiting.id(), vm.id());
        Some(waiting.id())
    }

    /// Moves every VM waiting on the mailbox of `vm` onto its ready list.
    /// Returns how many were notified.
    pub fn notify_waiters(&self, vm: &Vm<H>) -> usize {
        let mut count = 0;
        while self.mailbox_waiter_get(vm).is_some() {
            count += 1;
        }
        count
    }

    /// Takes the next notification off the ready list of `vm`, returning the id
    /// of the VM whose mailbox became writable.
    pub fn mailbox_writable_get(&self, vm: &Vm<H>) -> Option<VmId> {
        let mut locked = vm.lock();
        let target_index = locked.list_pop(self, ListKind::Ready)?;
        Some(self.vm_at(target_index).id())
    }
}
