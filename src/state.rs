use std::{
    cell::RefCell,
    ops::Deref,
    rc::{Rc, Weak},
};

use crate::math::{axpy, axpy_out, scalar_prods2, scalar_prods3};

struct StateStorage {
    free_states: RefCell<Vec<Rc<InnerStateReusable>>>,
}

/// Arena of phase space states for one chain.
///
/// Trajectories allocate a few states per leapfrog step. Dropped states go
/// back to the pool instead of being freed, so after the first iterations a
/// chain does not allocate any more.
pub(crate) struct StatePool {
    storage: Rc<StateStorage>,
    dim: usize,
}

impl StatePool {
    pub(crate) fn new(dim: usize, capacity: usize) -> StatePool {
        StatePool {
            storage: Rc::new(StateStorage {
                free_states: RefCell::new(Vec::with_capacity(capacity)),
            }),
            dim,
        }
    }

    pub(crate) fn new_state(&self) -> State {
        let inner = match self.storage.free_states.borrow_mut().pop() {
            Some(inner) => inner,
            None => Rc::new(InnerStateReusable::new(self.dim, &self.storage)),
        };
        State {
            inner: std::mem::ManuallyDrop::new(inner),
        }
    }

    pub(crate) fn copy_state(&self, state: &State) -> State {
        let mut new_state = self.new_state();

        let InnerState {
            q,
            p,
            p_sum,
            grad,
            v,
            idx_in_trajectory,
            kinetic_energy,
            potential_energy,
        } = new_state
            .try_mut_inner()
            .expect("New state should not have references");

        q.copy_from_slice(&state.q);
        p.copy_from_slice(&state.p);
        p_sum.copy_from_slice(&state.p_sum);
        grad.copy_from_slice(&state.grad);
        v.copy_from_slice(&state.v);
        *idx_in_trajectory = state.idx_in_trajectory;
        *kinetic_energy = state.kinetic_energy;
        *potential_energy = state.potential_energy;

        new_state
    }

    #[cfg(test)]
    fn num_free(&self) -> usize {
        self.storage.free_states.borrow().len()
    }
}

/// A point in phase space together with its place in the current trajectory.
///
/// `grad` and `potential_energy` always belong to `q`, `v` and
/// `kinetic_energy` always belong to `p`. `p_sum` is the sum of momenta from
/// the initial point of the trajectory up to this point (excluding the
/// initial point for states left of it), which is what the U-turn
/// criterion needs.
#[derive(Debug, Clone)]
pub(crate) struct InnerState {
    pub(crate) p: Box<[f64]>,
    pub(crate) q: Box<[f64]>,
    pub(crate) v: Box<[f64]>,
    pub(crate) p_sum: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
}

struct InnerStateReusable {
    inner: InnerState,
    reuser: Weak<StateStorage>,
}

impl InnerStateReusable {
    fn new(dim: usize, owner: &Rc<StateStorage>) -> InnerStateReusable {
        InnerStateReusable {
            inner: InnerState {
                p: vec![0.; dim].into(),
                q: vec![0.; dim].into(),
                v: vec![0.; dim].into(),
                p_sum: vec![0.; dim].into(),
                grad: vec![0.; dim].into(),
                idx_in_trajectory: 0,
                kinetic_energy: 0.,
                potential_energy: 0.,
            },
            reuser: Rc::downgrade(owner),
        }
    }
}

/// Shared handle to a pooled state. Cloning is cheap, mutation is only
/// possible while the handle is unique.
pub(crate) struct State {
    inner: std::mem::ManuallyDrop<Rc<InnerStateReusable>>,
}

impl Deref for State {
    type Target = InnerState;

    fn deref(&self) -> &Self::Target {
        &self.inner.inner
    }
}

#[derive(Debug)]
pub(crate) struct StateInUse {}

impl State {
    pub(crate) fn try_mut_inner(&mut self) -> Result<&mut InnerState, StateInUse> {
        match Rc::get_mut(&mut self.inner) {
            Some(val) => Ok(&mut val.inner),
            None => Err(StateInUse {}),
        }
    }

    pub(crate) fn energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }

    pub(crate) fn logp(&self) -> f64 {
        -self.potential_energy
    }

    pub(crate) fn index_in_trajectory(&self) -> i64 {
        self.idx_in_trajectory
    }

    pub(crate) fn write_position(&self, out: &mut [f64]) {
        out.copy_from_slice(&self.q);
    }

    /// Mark this state as the origin of a new trajectory.
    pub(crate) fn make_init_point(&mut self) {
        let inner = self.try_mut_inner().expect("State already in use");
        inner.idx_in_trajectory = 0;
        inner.p_sum.copy_from_slice(&inner.p);
    }

    /// Generalized no-U-turn criterion between two states of a trajectory.
    ///
    /// With `rho` the sum of momenta from the left to the right state, the
    /// trajectory is turning if `rho . v_left < 0` or `rho . v_right < 0`.
    pub(crate) fn is_turning(&self, other: &Self) -> bool {
        let (start, end) = if self.idx_in_trajectory < other.idx_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.idx_in_trajectory;
        let b = end.idx_in_trajectory;

        assert!(a < b);
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(&end.p_sum, &start.p_sum, &start.p, &end.v, &start.v)
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.v, &start.v)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(&start.p_sum, &end.p_sum, &end.p, &end.v, &start.v)
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    pub(crate) fn first_momentum_halfstep(&self, out: &mut Self, epsilon: f64) {
        axpy_out(
            &self.grad,
            &self.p,
            epsilon / 2.,
            &mut out.try_mut_inner().expect("State already in use").p,
        );
    }

    /// Position update using the velocity already stored in `out`.
    pub(crate) fn position_step(&self, out: &mut Self, epsilon: f64) {
        let out = out.try_mut_inner().expect("State already in use");
        axpy_out(&out.v, &self.q, epsilon, &mut out.q);
    }

    pub(crate) fn second_momentum_halfstep(&mut self, epsilon: f64) {
        let inner = self.try_mut_inner().expect("State already in use");
        axpy(&inner.grad, &mut inner.p, epsilon / 2.);
    }

    /// Extend the momentum sum of `self` by the momentum of `target`.
    pub(crate) fn set_psum(&self, target: &mut Self) {
        let out = target.try_mut_inner().expect("State already in use");

        assert!(out.idx_in_trajectory != 0);

        if out.idx_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.p);
        } else {
            axpy_out(&out.p, &self.p_sum, 1., &mut out.p_sum);
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        // SAFETY: `inner` is never accessed again after this point.
        let rc = unsafe { std::mem::ManuallyDrop::take(&mut self.inner) };
        if (Rc::strong_count(&rc) == 1) & (Rc::weak_count(&rc) == 0) {
            if let Some(storage) = rc.reuser.upgrade() {
                storage.free_states.borrow_mut().push(rc);
            }
        }
    }
}

impl Clone for State {
    fn clone(&self) -> Self {
        State {
            inner: self.inner.clone(),
        }
    }
}
