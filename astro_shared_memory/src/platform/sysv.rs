//! SysV IPC calls used by the shared data region.
//!
//! Thin wrappers that turn the C return conventions into [`ShmResult`].
//! Nothing here knows about the region layout.

use crate::error::{ShmError, ShmResult};
use std::io;
use std::ptr::NonNull;

/// Create a private shared memory id of `size` bytes.
pub fn shm_create(size: usize) -> ShmResult<i32> {
    let id = unsafe { libc::shmget(libc::IPC_PRIVATE, size, 0o666) };
    if id < 0 {
        return Err(ShmError::shm("shmget"));
    }
    Ok(id)
}

/// Map `shm_id` into this process.
pub fn shm_attach(shm_id: i32, read_only: bool) -> ShmResult<NonNull<u8>> {
    let flags = if read_only { libc::SHM_RDONLY } else { 0 };
    let ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), flags) };
    if ptr as isize == -1 {
        return Err(ShmError::shm("shmat"));
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| ShmError::SharedMemory {
        op: "shmat",
        source: io::Error::other("null mapping"),
    })
}

/// Size of the shared memory id in bytes.
pub fn shm_size(shm_id: i32) -> ShmResult<usize> {
    let mut ds: libc::shmid_ds = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::shmctl(shm_id, libc::IPC_STAT, &mut ds) };
    if ret < 0 {
        return Err(ShmError::shm("shmctl(IPC_STAT)"));
    }
    Ok(ds.shm_segsz as usize)
}

/// Mark the id for destruction once the last process detaches.
pub fn shm_mark_removed(shm_id: i32) -> ShmResult<()> {
    let ret = unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };
    if ret < 0 {
        return Err(ShmError::shm("shmctl(IPC_RMID)"));
    }
    Ok(())
}

pub fn shm_detach(base: NonNull<u8>) -> ShmResult<()> {
    let ret = unsafe { libc::shmdt(base.as_ptr().cast::<libc::c_void>()) };
    if ret < 0 {
        return Err(ShmError::shm("shmdt"));
    }
    Ok(())
}

/// Create a private set of `count` semaphores.
pub fn sem_create(count: usize) -> ShmResult<i32> {
    let id = unsafe { libc::semget(libc::IPC_PRIVATE, count as libc::c_int, 0o666) };
    if id < 0 {
        return Err(ShmError::sem("semget", 0));
    }
    Ok(id)
}

pub fn sem_set(sem_id: i32, index: usize, value: i32) -> ShmResult<()> {
    let ret = unsafe { libc::semctl(sem_id, index as libc::c_int, libc::SETVAL, value) };
    if ret < 0 {
        return Err(ShmError::sem("semctl(SETVAL)", index));
    }
    Ok(())
}

/// Single semaphore operation with `SEM_UNDO`, so a crashed holder
/// releases automatically.
pub fn sem_op(sem_id: i32, index: usize, delta: i16) -> ShmResult<()> {
    let mut op = libc::sembuf {
        sem_num: index as libc::c_ushort,
        sem_op: delta as libc::c_short,
        sem_flg: libc::SEM_UNDO as libc::c_short,
    };
    loop {
        let ret = unsafe { libc::semop(sem_id, &mut op, 1) };
        if ret == 0 {
            return Ok(());
        }
        if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            return Err(ShmError::sem("semop", index));
        }
    }
}

pub fn sem_remove(sem_id: i32) -> ShmResult<()> {
    let ret = unsafe { libc::semctl(sem_id, 0, libc::IPC_RMID) };
    if ret < 0 {
        return Err(ShmError::sem("semctl(IPC_RMID)", 0));
    }
    Ok(())
}
