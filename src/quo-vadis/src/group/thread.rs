//! In-process groups for multi-threaded callers.
//!
//! A [`ThreadTeam`] is created once per process with a fixed member count;
//! each member thread obtains its [`ThreadGroup`] handle by rank.
//! Collectives run over a slot vector guarded by a barrier: writers fill
//! their slot, everybody meets at the barrier, readers drain, and a second
//! barrier closes the round so slots can be reused.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use dashmap::DashMap;
use qv_rc::{QvResult, ReturnCode};
use qv_wire::Bbuff;

use super::{next_group_id, process::ProcessGroup, Group, GROUP_ID_NODE};

struct Shared {
    uid: u64,
    size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Bbuff>>>,
    split_seq: AtomicU64,
    // Members that have picked up this group after a split; the last one
    // retires the registry entry.
    joined: AtomicUsize,
}

impl Shared {
    fn new(uid: u64, size: usize) -> Self {
        Shared {
            uid,
            size,
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![None; size]),
            split_seq: AtomicU64::new(0),
            joined: AtomicUsize::new(0),
        }
    }
}

pub struct ThreadTeam {
    world: Arc<Shared>,
    children: DashMap<(u64, u64, i32), Arc<Shared>>,
}

impl ThreadTeam {
    /// A team of `size` cooperating threads.
    pub fn new(size: usize) -> QvResult<Arc<Self>> {
        if size == 0 {
            return Err(ReturnCode::InvalidArg);
        }
        // The team-wide group is the node group; split children draw
        // fresh table ids.
        Ok(Arc::new(ThreadTeam {
            world: Arc::new(Shared::new(GROUP_ID_NODE, size)),
            children: DashMap::new(),
        }))
    }

    /// The whole-team group handle for member `rank`. Must be called on
    /// the member's own thread: the task id is the calling thread's tid.
    pub fn group(self: &Arc<Self>, rank: usize) -> QvResult<ThreadGroup> {
        if rank >= self.world.size {
            return Err(ReturnCode::InvalidArg);
        }
        Ok(ThreadGroup {
            team: Arc::clone(self),
            shared: Arc::clone(&self.world),
            rank,
            task_id: nix::unistd::gettid().as_raw() as i64,
        })
    }
}

pub struct ThreadGroup {
    team: Arc<ThreadTeam>,
    shared: Arc<Shared>,
    rank: usize,
    task_id: i64,
}

impl ThreadGroup {
    fn lock_slots(&self) -> QvResult<std::sync::MutexGuard<'_, Vec<Option<Bbuff>>>> {
        self.shared.slots.lock().map_err(|_| ReturnCode::Internal)
    }

    /// Every member contributes one buffer and receives all of them in
    /// rank order.
    fn exchange_all(&self, tx: &Bbuff) -> QvResult<Vec<Bbuff>> {
        self.lock_slots()?[self.rank] = Some(tx.clone());
        self.shared.barrier.wait();
        let all = {
            let slots = self.lock_slots()?;
            slots
                .iter()
                .map(|s| s.clone().ok_or(ReturnCode::Internal))
                .collect::<QvResult<Vec<_>>>()?
        };
        self.shared.barrier.wait();
        Ok(all)
    }
}

impl Group for ThreadGroup {
    fn id(&self) -> i32 {
        self.rank as i32
    }

    fn size(&self) -> i32 {
        self.shared.size as i32
    }

    fn task_id(&self) -> i64 {
        self.task_id
    }

    fn barrier(&self) -> QvResult<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn gather(&self, tx: &Bbuff, root: i32) -> QvResult<Option<Vec<Bbuff>>> {
        if root < 0 || root as usize >= self.shared.size {
            return Err(ReturnCode::InvalidArg);
        }
        self.lock_slots()?[self.rank] = Some(tx.clone());
        self.shared.barrier.wait();
        let result = if self.rank == root as usize {
            let mut slots = self.lock_slots()?;
            let drained = slots
                .iter_mut()
                .map(|s| s.take().ok_or(ReturnCode::Internal))
                .collect::<QvResult<Vec<_>>>()?;
            Some(drained)
        } else {
            None
        };
        self.shared.barrier.wait();
        Ok(result)
    }

    fn scatter(&self, tx: Option<&[Bbuff]>, root: i32) -> QvResult<Bbuff> {
        if root < 0 || root as usize >= self.shared.size {
            return Err(ReturnCode::InvalidArg);
        }
        if self.rank == root as usize {
            let bufs = tx.ok_or(ReturnCode::InvalidArg)?;
            if bufs.len() != self.shared.size {
                return Err(ReturnCode::InvalidArg);
            }
            let mut slots = self.lock_slots()?;
            for (slot, buf) in slots.iter_mut().zip(bufs.iter()) {
                *slot = Some(buf.clone());
            }
        }
        self.shared.barrier.wait();
        let mine = self.lock_slots()?[self.rank]
            .take()
            .ok_or(ReturnCode::Internal)?;
        self.shared.barrier.wait();
        Ok(mine)
    }

    fn split(&self, color: i32, key: i32) -> QvResult<Box<dyn Group>> {
        // Exchange (color, key) pairs; rank 0 also publishes the split
        // sequence number that keys the child registry.
        let seq_local = if self.rank == 0 {
            self.shared.split_seq.fetch_add(1, Ordering::Relaxed)
        } else {
            0
        };
        let mut raw = [0u8; 16];
        LittleEndian::write_i32(&mut raw[0..4], color);
        LittleEndian::write_i32(&mut raw[4..8], key);
        LittleEndian::write_u64(&mut raw[8..16], seq_local);
        let mut tx = Bbuff::new();
        tx.append(&raw);

        let all = self.exchange_all(&tx)?;
        let mut colors = Vec::with_capacity(all.len());
        let mut keys = Vec::with_capacity(all.len());
        for buf in &all {
            let data = buf.data();
            if data.len() != 16 {
                return Err(ReturnCode::Internal);
            }
            colors.push(LittleEndian::read_i32(&data[0..4]));
            keys.push(LittleEndian::read_i32(&data[4..8]));
        }
        let seq = LittleEndian::read_u64(&all[0].data()[8..16]);

        // Members of my child, ranked by (key, parent rank) ascending.
        let mut members: Vec<usize> = (0..self.shared.size)
            .filter(|r| colors[*r] == color)
            .collect();
        members.sort_by_key(|r| (keys[*r], *r));
        let new_rank = members
            .iter()
            .position(|r| *r == self.rank)
            .ok_or(ReturnCode::Internal)?;

        let candidate_uid = next_group_id()?;
        let child_key = (self.shared.uid, seq, color);
        let child = self
            .team
            .children
            .entry(child_key)
            .or_insert_with(|| Arc::new(Shared::new(candidate_uid, members.len())))
            .clone();
        if child.joined.fetch_add(1, Ordering::AcqRel) + 1 == members.len() {
            self.team.children.remove(&child_key);
        }

        Ok(Box::new(ThreadGroup {
            team: Arc::clone(&self.team),
            shared: child,
            rank: new_rank,
            task_id: self.task_id,
        }))
    }

    fn self_group(&self) -> QvResult<Box<dyn Group>> {
        Ok(Box::new(ProcessGroup::for_task(self.task_id)))
    }

    fn dup(&self) -> QvResult<Box<dyn Group>> {
        Ok(Box::new(ThreadGroup {
            team: Arc::clone(&self.team),
            shared: Arc::clone(&self.shared),
            rank: self.rank,
            task_id: self.task_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_team<F>(size: usize, f: F)
    where
        F: Fn(ThreadGroup) + Send + Sync + 'static,
    {
        let team = ThreadTeam::new(size).unwrap();
        let f = Arc::new(f);
        let mut handles = Vec::new();
        for rank in 0..size {
            let team = Arc::clone(&team);
            let f = Arc::clone(&f);
            handles.push(thread::spawn(move || {
                let group = team.group(rank).unwrap();
                f(group);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    fn payload(rank: usize) -> Bbuff {
        let mut buff = Bbuff::new();
        buff.append(format!("rank-{rank}").as_bytes());
        buff
    }

    #[test]
    fn gather_preserves_rank_order() {
        run_team(4, |group| {
            let rank = group.id() as usize;
            let gathered = group.gather(&payload(rank), 0).unwrap();
            match (rank, gathered) {
                (0, Some(bufs)) => {
                    let got: Vec<String> = bufs
                        .iter()
                        .map(|b| String::from_utf8(b.data().to_vec()).unwrap())
                        .collect();
                    assert_eq!(got, ["rank-0", "rank-1", "rank-2", "rank-3"]);
                }
                (0, None) => panic!("root received nothing"),
                (_, result) => assert!(result.is_none()),
            }
        });
    }

    #[test]
    fn scatter_delivers_by_rank() {
        run_team(3, |group| {
            let rank = group.id() as usize;
            let tx: Option<Vec<Bbuff>> =
                (rank == 1).then(|| (0..3).map(payload).collect());
            let rx = group.scatter(tx.as_deref(), 1).unwrap();
            assert_eq!(rx, payload(rank));
        });
    }

    #[test]
    fn split_by_color_and_key() {
        run_team(4, |group| {
            let rank = group.id() as usize;
            // Colors 0,0,1,1; keys reversed so in-child ranks flip.
            let color = (rank / 2) as i32;
            let key = -(rank as i32);
            let child = group.split(color, key).unwrap();
            assert_eq!(child.size(), 2);
            let expected_rank = match rank {
                0 | 2 => 1,
                _ => 0,
            };
            assert_eq!(child.id(), expected_rank);
            child.barrier().unwrap();
        });
    }

    #[test]
    fn consecutive_splits_do_not_collide() {
        run_team(2, |group| {
            let first = group.split(0, group.id()).unwrap();
            let second = group.split(group.id(), 0).unwrap();
            assert_eq!(first.size(), 2);
            assert_eq!(second.size(), 1);
            assert_eq!(second.id(), 0);
        });
    }

    #[test]
    fn self_group_is_singleton() {
        run_team(2, |group| {
            let selfg = group.self_group().unwrap();
            assert_eq!(selfg.size(), 1);
            assert_eq!(selfg.id(), 0);
            assert_eq!(selfg.task_id(), group.task_id());
        });
    }

    #[test]
    fn zero_sized_team_is_rejected() {
        assert!(ThreadTeam::new(0).is_err());
    }
}
