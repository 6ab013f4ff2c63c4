use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{AcquireError, Mutex, Notify, OwnedSemaphorePermit, Semaphore};

/// Queued item. Lower `priority` values run first; equal priorities run in
/// arrival order.
#[derive(Debug)]
pub struct ScheduledTask<T> {
  pub priority: i32,
  pub sequence: u64,
  pub item: T,
}

impl<T> Eq for ScheduledTask<T> {}

impl<T> PartialEq for ScheduledTask<T> {
  fn eq(&self, other: &Self) -> bool {
    self.priority == other.priority && self.sequence == other.sequence
  }
}

impl<T> PartialOrd for ScheduledTask<T> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl<T> Ord for ScheduledTask<T> {
  fn cmp(&self, other: &Self) -> Ordering {
    other.priority.cmp(&self.priority)
      .then_with(|| other.sequence.cmp(&self.sequence))
  }
}

pub struct Scheduler<T> {
  queue: Mutex<BinaryHeap<ScheduledTask<T>>>,
  available: Notify,
  sequence: AtomicU64,
}

impl<T> Default for Scheduler<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Scheduler<T> {
  pub fn new() -> Self {
    Self {
      queue: Mutex::new(BinaryHeap::new()),
      available: Notify::new(),
      sequence: AtomicU64::new(0),
    }
  }

  pub async fn add_task(&self, priority: i32, item: T) {
    let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
    self.queue.lock().await.push(ScheduledTask { priority, sequence, item });
    self.available.notify_one();
  }

  pub async fn get_next(&self) -> Option<ScheduledTask<T>> {
    self.queue.lock().await.pop()
  }

  /// Waits until a task is queued and pops the most urgent one.
  pub async fn next(&self) -> ScheduledTask<T> {
    loop {
      if let Some(task) = self.get_next().await {
        return task;
      }
      self.available.notified().await;
    }
  }

  /// Waits for a free slot first and only then pops, so messages queued while
  /// every slot is busy still compete on priority.
  pub async fn next_with_permit(&self, slots: Arc<Semaphore>) -> Result<(OwnedSemaphorePermit, ScheduledTask<T>), AcquireError> {
    let permit = slots.acquire_owned().await?;
    Ok((permit, self.next().await))
  }

  #[cfg(test)]
  async fn len(&self) -> usize {
    self.queue.lock().await.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn lower_priority_value_runs_first_then_fifo() {
    let scheduler = Scheduler::new();
    scheduler.add_task(5, "a").await;
    scheduler.add_task(1, "urgent").await;
    scheduler.add_task(5, "b").await;
    scheduler.add_task(9, "later").await;

    let mut order = Vec::new();
    while let Some(task) = scheduler.get_next().await {
      order.push(task.item);
    }
    assert_eq!(order, vec!["urgent", "a", "b", "later"]);
  }

  #[tokio::test]
  async fn next_waits_for_work() {
    let scheduler = Arc::new(Scheduler::new());
    let waiter = {
      let scheduler = scheduler.clone();
      tokio::spawn(async move { scheduler.next().await.item })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    scheduler.add_task(5, 42).await;
    assert_eq!(waiter.await.unwrap(), 42);
    assert_eq!(scheduler.len().await, 0);
  }

  #[tokio::test]
  async fn urgent_task_queued_while_slots_are_busy_runs_first() {
    let scheduler = Arc::new(Scheduler::new());
    let slots = Arc::new(Semaphore::new(0));
    scheduler.add_task(9, "bulk").await;

    let waiter = {
      let scheduler = scheduler.clone();
      let slots = slots.clone();
      tokio::spawn(async move { scheduler.next_with_permit(slots).await.unwrap().1.item })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    scheduler.add_task(1, "urgent").await;
    slots.add_permits(1);

    assert_eq!(waiter.await.unwrap(), "urgent");
    assert_eq!(scheduler.len().await, 1);
  }
}
