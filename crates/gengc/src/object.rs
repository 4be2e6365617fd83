//! Heap object model: addresses, type descriptors and the atomic mark word.
//!
//! The collector never interprets object contents beyond two queries derived
//! from the type descriptor — the object's size and whether it carries
//! reference fields — plus the descriptor-supplied field enumerator that
//! reports every reference slot to a [`SlotVisitor`].
//!
//! The first word of every object is its [`MarkWord`]: either a pointer to
//! the object's `'static` [`TypeDescriptor`], or, only while a collection
//! cycle is live and only after the object has been evacuated, a forwarding
//! address with the low tag bit set. The Live → Forwarded transition happens
//! at most once per cycle, through a single compare-exchange; that CAS is the
//! sole deduplication mechanism between racing evacuation workers.

use std::sync::atomic::{AtomicUsize, Ordering};

/// An untyped heap address. `0` is the null reference.
pub type Address = usize;

/// The null object reference.
pub const NULL_ADDRESS: Address = 0;

/// Minimum alignment of objects and reference slots.
pub const SLOT_SIZE: usize = std::mem::size_of::<usize>();

/// Size of the object header (the mark word).
pub const HEADER_SIZE: usize = SLOT_SIZE;

const FORWARD_TAG: usize = 1;

/// Rounds `value` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Receiver for the reference slots of one object, driven by the object
/// model's [`TypeDescriptor::visit_refs`] enumerator.
///
/// `host` is the address of the object owning the slot, or `NULL_ADDRESS`
/// when the slot is an external root. `slot` is the address of the field
/// itself; the collector may rewrite it in place during evacuation.
pub trait SlotVisitor {
    /// Reports a strong reference slot.
    fn visit_slot(&mut self, host: Address, slot: Address);

    /// Reports a weak reference slot. Weak slots never keep their referent
    /// alive; dead referents are cleared to null after reclamation.
    fn visit_weak_slot(&mut self, host: Address, slot: Address);
}

/// External type descriptor, supplied by the object model.
///
/// Descriptors must live for the program's duration and be 8-byte aligned so
/// the forwarding tag bit is always free in a descriptor pointer.
pub struct TypeDescriptor {
    /// Object size in bytes, header included. Must be a multiple of
    /// [`SLOT_SIZE`]. Free-list span descriptors set this to `0` and store
    /// the span length in the word after the header.
    pub size: usize,
    /// Descriptor flags, see the `FLAG_*` constants.
    pub flags: u32,
    /// Enumerates every reference field of an object of this type.
    pub visit_refs: fn(Address, &mut dyn SlotVisitor),
}

impl TypeDescriptor {
    /// The described span is free-list memory, not a live object.
    pub const FLAG_FREE: u32 = 1 << 0;
    /// Objects of this type carry reference fields.
    pub const FLAG_HAS_REFS: u32 = 1 << 1;

    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.flags & Self::FLAG_FREE != 0
    }

    #[inline]
    #[must_use]
    pub const fn has_reference_fields(&self) -> bool {
        self.flags & Self::FLAG_HAS_REFS != 0
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

fn visit_no_refs(_object: Address, _visitor: &mut dyn SlotVisitor) {}

/// Header of a free-list span of arbitrary length; the span length lives in
/// the word after the header.
pub static FREE_SPAN: TypeDescriptor = TypeDescriptor {
    size: 0,
    flags: TypeDescriptor::FLAG_FREE,
    visit_refs: visit_no_refs,
};

/// One-word filler for remainders too small to carry a length word.
pub static FREE_SPAN_ONE: TypeDescriptor = TypeDescriptor {
    size: SLOT_SIZE,
    flags: TypeDescriptor::FLAG_FREE,
    visit_refs: visit_no_refs,
};

/// Two-word filler.
pub static FREE_SPAN_TWO: TypeDescriptor = TypeDescriptor {
    size: 2 * SLOT_SIZE,
    flags: TypeDescriptor::FLAG_FREE,
    visit_refs: visit_no_refs,
};

/// Decoded state of an object header.
#[derive(Clone, Copy)]
pub enum MarkWordValue {
    /// The object is at this address; the descriptor gives size and layout.
    Live(&'static TypeDescriptor),
    /// The object was evacuated this cycle to the given address.
    Forwarded(Address),
}

/// Atomic view of an object's header word.
#[repr(transparent)]
pub struct MarkWord(AtomicUsize);

impl MarkWord {
    /// Returns the mark word of the object at `object`.
    ///
    /// # Safety
    ///
    /// `object` must be the address of a live heap object whose header has
    /// been installed and whose region is still mapped.
    #[inline]
    pub unsafe fn of<'a>(object: Address) -> &'a Self {
        unsafe { &*(object as *const Self) }
    }

    /// Decodes the current header state.
    #[inline]
    pub fn value(&self) -> MarkWordValue {
        decode(self.0.load(Ordering::Acquire))
    }

    /// Installs a descriptor header. Used once, at allocation.
    #[inline]
    pub fn install(&self, descriptor: &'static TypeDescriptor) {
        self.0
            .store(descriptor as *const TypeDescriptor as usize, Ordering::Release);
    }

    /// Attempts the Live → Forwarded transition.
    ///
    /// Exactly one caller per object per cycle succeeds. Losers receive the
    /// forwarding address installed by the winner.
    #[inline]
    pub fn try_forward(
        &self,
        current: &'static TypeDescriptor,
        to: Address,
    ) -> Result<(), Address> {
        debug_assert_eq!(to & FORWARD_TAG, 0, "forwarding address must be aligned");
        let expected = current as *const TypeDescriptor as usize;
        match self.0.compare_exchange(
            expected,
            to | FORWARD_TAG,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(observed) => {
                // A Live header never changes to another Live value inside a
                // cycle, so the observed value must carry the tag bit.
                debug_assert_ne!(observed & FORWARD_TAG, 0);
                Err(observed & !FORWARD_TAG)
            }
        }
    }
}

#[inline]
fn decode(bits: usize) -> MarkWordValue {
    if bits & FORWARD_TAG != 0 {
        MarkWordValue::Forwarded(bits & !FORWARD_TAG)
    } else {
        // SAFETY: an untagged header is always a descriptor pointer written
        // by `install` or by an evacuation copy of an installed header.
        MarkWordValue::Live(unsafe { &*(bits as *const TypeDescriptor) })
    }
}

/// Size in bytes of the object at `object`, derived from its descriptor.
/// Free spans read their length from the word after the header.
///
/// # Safety
///
/// `object` must address a live (non-forwarded) object or free span.
#[inline]
pub unsafe fn size_of_object(object: Address) -> usize {
    match unsafe { MarkWord::of(object).value() } {
        MarkWordValue::Live(desc) => {
            if desc.is_free() && desc.size == 0 {
                unsafe { load_slot(object + HEADER_SIZE) }
            } else {
                desc.size
            }
        }
        MarkWordValue::Forwarded(_) => {
            unreachable!("size queried on a forwarded object")
        }
    }
}

/// Atomically reads a reference slot.
///
/// All reference-slot accesses go through atomic loads and stores because
/// concurrent markers may traverse the graph while the mutator runs.
///
/// # Safety
///
/// `slot` must be a mapped, 8-aligned address.
#[inline]
pub unsafe fn load_slot(slot: Address) -> Address {
    unsafe { (*(slot as *const AtomicUsize)).load(Ordering::Acquire) }
}

/// Atomically writes a reference slot.
///
/// # Safety
///
/// `slot` must be a mapped, 8-aligned address.
#[inline]
pub unsafe fn store_slot(slot: Address, value: Address) {
    unsafe { (*(slot as *const AtomicUsize)).store(value, Ordering::Release) }
}

#[cfg(test)]
mod tests {
    use super::*;

    static DESC: TypeDescriptor = TypeDescriptor {
        size: 3 * SLOT_SIZE,
        flags: TypeDescriptor::FLAG_HAS_REFS,
        visit_refs: visit_no_refs,
    };

    #[test]
    fn mark_word_round_trips_descriptor() {
        let header = AtomicUsize::new(0);
        let word: &MarkWord = unsafe { &*(&raw const header).cast() };
        word.install(&DESC);
        match word.value() {
            MarkWordValue::Live(d) => assert!(std::ptr::eq(d, &DESC)),
            MarkWordValue::Forwarded(_) => panic!("fresh header must be live"),
        }
    }

    #[test]
    fn forward_succeeds_once() {
        let header = AtomicUsize::new(0);
        let word: &MarkWord = unsafe { &*(&raw const header).cast() };
        word.install(&DESC);

        assert!(word.try_forward(&DESC, 0x1000).is_ok());
        assert_eq!(word.try_forward(&DESC, 0x2000), Err(0x1000));
        match word.value() {
            MarkWordValue::Forwarded(to) => assert_eq!(to, 0x1000),
            MarkWordValue::Live(_) => panic!("header must be forwarded"),
        }
    }

    #[test]
    fn free_span_size_comes_from_memory() {
        let mut span = [0usize; 4];
        span[0] = &FREE_SPAN as *const TypeDescriptor as usize;
        span[1] = 4 * SLOT_SIZE;
        let base = span.as_ptr() as Address;
        assert_eq!(unsafe { size_of_object(base) }, 4 * SLOT_SIZE);

        let mut filler = [0usize; 1];
        filler[0] = &FREE_SPAN_ONE as *const TypeDescriptor as usize;
        assert_eq!(unsafe { size_of_object(filler.as_ptr() as Address) }, SLOT_SIZE);
    }

    #[test]
    fn align_up_is_idempotent() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(17, 8), 24);
    }
}
