//! Registry of cancellable in-flight operations.

use std::{collections::HashMap, sync::Arc};

use bluer::Address;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::oneshot;

use crate::adapter::TransactionId;

/// What an in-flight operation can be cancelled by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
   /// Host supplied transaction id.
   Transaction(SmolStr),
   /// A pending connection attempt.
   Connection(Address),
   /// Only cancelled when the client goes away.
   Untracked,
}

impl From<TransactionId> for Tag {
   fn from(id: TransactionId) -> Self {
      id.map_or(Self::Untracked, Self::Transaction)
   }
}

struct Pending {
   tag: Tag,
   cancel: oneshot::Sender<()>,
}

#[derive(Default)]
struct Table {
   next_ticket: u64,
   pending: HashMap<u64, Pending>,
}

/// Handle for one registered operation.
#[derive(Debug)]
pub struct Ticket {
   pub id: u64,
   /// Resolves once the operation is cancelled.
   pub cancelled: oneshot::Receiver<()>,
}

#[derive(Clone, Default)]
pub struct Transactions {
   table: Arc<Mutex<Table>>,
}

impl Transactions {
   pub fn begin(&self, tag: Tag) -> Ticket {
      let (cancel, cancelled) = oneshot::channel();
      let mut table = self.table.lock();
      let id = table.next_ticket;
      table.next_ticket += 1;
      table.pending.insert(id, Pending { tag, cancel });
      Ticket { id, cancelled }
   }

   /// Forgets a finished operation.
   pub fn end(&self, ticket: u64) {
      self.table.lock().pending.remove(&ticket);
   }

   /// Cancels every operation carrying `tag`, returning how many there were.
   pub fn cancel(&self, tag: &Tag) -> usize {
      let cancelled: Vec<Pending> = {
         let mut table = self.table.lock();
         let tickets: Vec<u64> = table
            .pending
            .iter()
            .filter(|(_, p)| &p.tag == tag)
            .map(|(&ticket, _)| ticket)
            .collect();
         tickets
            .into_iter()
            .filter_map(|ticket| table.pending.remove(&ticket))
            .collect()
      };
      let count = cancelled.len();
      for pending in cancelled {
         let _ = pending.cancel.send(());
      }
      count
   }

   pub fn cancel_all(&self) -> usize {
      let drained: Vec<Pending> = self.table.lock().pending.drain().map(|(_, p)| p).collect();
      let count = drained.len();
      for pending in drained {
         let _ = pending.cancel.send(());
      }
      count
   }

   #[cfg(test)]
   pub fn len(&self) -> usize {
      self.table.lock().pending.len()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_tag_from_transaction_id() {
      assert_eq!(Tag::from(None), Tag::Untracked);
      assert_eq!(
         Tag::from(Some(SmolStr::new("t1"))),
         Tag::Transaction("t1".into())
      );
   }

   #[test]
   fn test_cancel_by_tag() {
      let transactions = Transactions::default();
      let mut a = transactions.begin(Tag::Transaction("a".into()));
      let mut a2 = transactions.begin(Tag::Transaction("a".into()));
      let mut b = transactions.begin(Tag::Transaction("b".into()));

      assert_eq!(transactions.cancel(&Tag::Transaction("a".into())), 2);
      assert!(a.cancelled.try_recv().is_ok());
      assert!(a2.cancelled.try_recv().is_ok());
      assert!(b.cancelled.try_recv().is_err());
      assert_eq!(transactions.len(), 1);

      assert_eq!(transactions.cancel(&Tag::Transaction("missing".into())), 0);
   }

   #[test]
   fn test_end_forgets_ticket() {
      let transactions = Transactions::default();
      let ticket = transactions.begin(Tag::Transaction("a".into()));
      transactions.end(ticket.id);
      assert_eq!(transactions.len(), 0);
      assert_eq!(transactions.cancel(&Tag::Transaction("a".into())), 0);
   }

   #[test]
   fn test_cancel_all() {
      let transactions = Transactions::default();
      let address = Address::new([1, 2, 3, 4, 5, 6]);
      let mut untracked = transactions.begin(Tag::Untracked);
      let mut connect = transactions.begin(Tag::Connection(address));

      assert_eq!(transactions.cancel_all(), 2);
      assert!(untracked.cancelled.try_recv().is_ok());
      assert!(connect.cancelled.try_recv().is_ok());
      assert_eq!(transactions.len(), 0);
   }
}
